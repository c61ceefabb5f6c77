//! Per-request context.
//!
//! Built by the HTTP layer once the address grammar is resolved, then
//! passed through every subsystem. The ACM engine fills in `auth` after
//! authentication.

use std::path::PathBuf;
use std::sync::Arc;

use crate::acm::AuthContext;
use crate::pipeline::Vars;

/// Everything a request knows about itself.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub account: String,
    pub repo: String,
    pub branch: String,
    /// `"<account>/<repo>/<branch>"`.
    pub key: String,
    pub repo_path: PathBuf,
    /// URL prefix content links are relocated against.
    pub base_path: String,
    pub hostname: String,
    /// Path segments after the resolved branch.
    pub trailing: Vec<String>,
    /// Whether the endpoint demands authentication.
    pub secure: bool,
    pub auth: Option<Arc<AuthContext>>,
}

impl RequestContext {
    pub fn new(
        account: &str,
        repo: &str,
        branch: &str,
        repo_path: PathBuf,
        base_path: &str,
        hostname: &str,
    ) -> Self {
        Self {
            account: account.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            key: format!("{account}/{repo}/{branch}"),
            repo_path,
            base_path: base_path.to_string(),
            hostname: hostname.to_string(),
            trailing: Vec::new(),
            secure: false,
            auth: None,
        }
    }

    /// The ACM group fingerprint, or the empty string pre-auth.
    pub fn group(&self) -> &str {
        self.auth.as_deref().map_or("", |auth| auth.group.as_str())
    }

    /// The trailing segments joined back into a path.
    pub fn trailing_path(&self) -> String {
        self.trailing.join("/")
    }

    /// Seed pipeline variables from this context.
    pub fn vars(&self) -> Vars {
        let mut vars = Vars::new();
        vars.set("ctx.account", &self.account)
            .set("ctx.repo", &self.repo)
            .set("ctx.branch", &self.branch)
            .set("ctx.key", &self.key)
            .set("ctx.hostname", &self.hostname)
            .set(
                "ctx.basePath",
                self.base_path.trim_matches('/').replace('/', "_"),
            )
            .set("ctx.auth.group", self.group());
        vars
    }
}
