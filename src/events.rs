//! In-process event fan-out.
//!
//! `content-repo-update` is the system-wide invalidation signal: the
//! builder (and the post-receive hook listener, through it) emits one
//! event per updated branch, and every cache keyed by that branch drops
//! its entry during dispatch. Subscribers run synchronously under the
//! subscriber-list lock, so by the time `emit_repo_update` returns, no
//! cache still holds the invalidated key.

use std::sync::Mutex;

/// A branch whose content changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUpdate {
    pub account: String,
    pub repo: String,
    pub branch: String,
    /// `"<account>/<repo>/<branch>"`.
    pub key: String,
}

impl RepoUpdate {
    pub fn new(account: &str, repo: &str, branch: &str) -> Self {
        Self {
            account: account.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            key: format!("{account}/{repo}/{branch}"),
        }
    }
}

type Subscriber = Box<dyn Fn(&RepoUpdate) + Send + Sync>;

/// Registry of event subscribers, owned by the composition root.
pub struct EventBus {
    repo_update: Mutex<Vec<Subscriber>>,
    build: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            repo_update: Mutex::new(Vec::new()),
            build: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to `content-repo-update`. Subscribers are called in
    /// registration order, synchronously with the emit.
    pub fn on_repo_update<F>(&self, subscriber: F)
    where
        F: Fn(&RepoUpdate) + Send + Sync + 'static,
    {
        self.repo_update.lock().unwrap().push(Box::new(subscriber));
    }

    /// Subscribe to `content-build`.
    pub fn on_build<F>(&self, subscriber: F)
    where
        F: Fn(&RepoUpdate) + Send + Sync + 'static,
    {
        self.build.lock().unwrap().push(Box::new(subscriber));
    }

    pub fn emit_repo_update(&self, event: &RepoUpdate) {
        log::debug!("content-repo-update {}", event.key);
        for subscriber in self.repo_update.lock().unwrap().iter() {
            subscriber(event);
        }
    }

    pub fn emit_build(&self, event: &RepoUpdate) {
        log::debug!("content-build {}", event.key);
        for subscriber in self.build.lock().unwrap().iter() {
            subscriber(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
