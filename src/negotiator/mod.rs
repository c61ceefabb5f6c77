//! Content negotiation over `index.*` representations.
//!
//! A resource is a directory holding one or more `index.*` files, each
//! a representation differing in media type, language, encoding, or
//! capability group. The negotiator indexes a branch's tracked files
//! into per-resource bundles and resolves a request to the best
//! representation through a chain of resolvers: media type, language,
//! encoding, then group, each defaulting to the wildcard when the
//! request expresses no usable preference.

mod mime;

pub use mime::{is_mime_type, mime_for_extension, mime_for_path};

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::context::RequestContext;
use crate::util::{CachingDedup, CachingDedupConfig};
use crate::vcr::GitAdapter;

#[derive(Debug, Clone, Error)]
pub enum NegotiatorError {
    #[error("version control error: {0}")]
    Vcr(String),

    #[error("branch '{0}' not found")]
    NoBranch(String),
}

impl From<crate::vcr::VcrError> for NegotiatorError {
    fn from(e: crate::vcr::VcrError) -> Self {
        NegotiatorError::Vcr(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NegotiatorError>;

/// Encodings recognized in representation file names.
const ENCODINGS: &[&str] = &[
    "ascii", "latin1", "iso8859-1", "ucs-2", "ucs2", "ucs-16le", "ucs16le", "utf-8", "utf8",
    "base64", "hex", "gzip",
];

// =============================================================================
// Representation
// =============================================================================

/// One concrete file able to satisfy a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    pub path: String,
    pub media_type: Option<String>,
    pub language: Option<String>,
    pub encoding: Option<String>,
    pub group: Option<String>,
}

impl Representation {
    /// Parse a representation from a tracked path whose basename begins
    /// with `index.`. Returns `None` for other paths.
    pub fn parse(path: &str) -> Option<Self> {
        let basename = path.rsplit('/').next().unwrap_or(path);
        let extensions = basename.strip_prefix("index.")?;
        if extensions.is_empty() {
            return None;
        }

        let mut rep = Self {
            path: path.to_string(),
            media_type: None,
            language: None,
            encoding: None,
            group: None,
        };
        for component in extensions.split('.') {
            if component.is_empty() {
                continue;
            }
            if is_mime_type(component) {
                rep.media_type = Some(component.to_string());
            } else if let Some(mime) = mime_for_extension(component) {
                rep.media_type = Some(mime.to_string());
            } else if ENCODINGS.contains(&component.to_ascii_lowercase().as_str()) {
                rep.encoding = Some(component.to_ascii_lowercase());
            } else if component.len() == 2
                && component.chars().all(|c| c.is_ascii_alphanumeric())
            {
                rep.language = Some(component.to_ascii_lowercase());
            } else {
                rep.group = Some(component.to_string());
            }
        }
        Some(rep)
    }

    /// Tree key `[type, language, encoding, group]` with wildcards.
    pub fn key(&self) -> [String; 4] {
        let star = || "*".to_string();
        [
            self.media_type.clone().unwrap_or_else(star),
            self.language.clone().unwrap_or_else(star),
            self.encoding.clone().unwrap_or_else(star),
            self.group.clone().unwrap_or_else(star),
        ]
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// Negotiation-relevant request headers.
#[derive(Debug, Clone, Default)]
pub struct NegotiationHeaders {
    pub accept: Option<String>,
    pub accept_language: Option<String>,
    pub accept_charset: Option<String>,
    pub accept_encoding: Option<String>,
}

impl NegotiationHeaders {
    /// Concatenation of all accept headers, for response cache keys.
    pub fn concat(&self) -> String {
        [
            self.accept.as_deref().unwrap_or(""),
            self.accept_language.as_deref().unwrap_or(""),
            self.accept_charset.as_deref().unwrap_or(""),
            self.accept_encoding.as_deref().unwrap_or(""),
        ]
        .join("|")
    }
}

/// The representations of one resource.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    reps: Vec<Representation>,
}

impl Bundle {
    pub fn push(&mut self, rep: Representation) {
        self.reps.push(rep);
    }

    pub fn has_groups(&self) -> bool {
        self.reps.iter().any(|r| r.group.is_some())
    }

    /// Resolve the best representation for the request.
    pub fn choose(
        &self,
        headers: &NegotiationHeaders,
        user_groups: &[String],
    ) -> Option<&Representation> {
        let mut candidates: Vec<&Representation> = self.reps.iter().collect();

        // Media type.
        candidates = resolve_level(candidates, |rep| rep.media_type.as_deref(), |values| {
            choose_media_type(headers.accept.as_deref(), values)
        });

        // Language.
        candidates = resolve_level(candidates, |rep| rep.language.as_deref(), |values| {
            choose_by_preference(headers.accept_language.as_deref(), values, normalize_language)
        });

        // Encoding: charset and transfer encodings share the level.
        candidates = resolve_level(candidates, |rep| rep.encoding.as_deref(), |values| {
            let merged = merge_headers(&headers.accept_charset, &headers.accept_encoding);
            choose_by_preference(merged.as_deref(), values, |s| s.to_ascii_lowercase())
        });

        // Group: first declared group the user belongs to.
        let grouped = candidates
            .iter()
            .find(|rep| {
                rep.group
                    .as_ref()
                    .is_some_and(|g| user_groups.iter().any(|ug| ug == g))
            })
            .copied();
        match grouped {
            Some(rep) => Some(rep),
            None => candidates
                .into_iter()
                .find(|rep| rep.group.is_none()),
        }
    }
}

/// Keep the candidates matching the resolved value for one level, or
/// those with no value (the `*` subtree) when resolution defaults.
fn resolve_level<'a>(
    candidates: Vec<&'a Representation>,
    value_of: impl Fn(&Representation) -> Option<&str>,
    resolve: impl Fn(Vec<&str>) -> Option<String>,
) -> Vec<&'a Representation> {
    let available: Vec<&str> = candidates.iter().filter_map(|r| value_of(r)).collect();
    if available.is_empty() {
        return candidates;
    }
    match resolve(available) {
        Some(chosen) => {
            let exact: Vec<&Representation> = candidates
                .iter()
                .filter(|r| value_of(r) == Some(chosen.as_str()))
                .copied()
                .collect();
            if exact.is_empty() {
                candidates
                    .into_iter()
                    .filter(|r| value_of(r).is_none())
                    .collect()
            } else {
                exact
            }
        }
        None => {
            let wildcard: Vec<&Representation> = candidates
                .iter()
                .filter(|r| value_of(r).is_none())
                .copied()
                .collect();
            if wildcard.is_empty() {
                candidates
            } else {
                wildcard
            }
        }
    }
}

/// Parse an accept-style header into values ordered by q-weight.
fn accept_order(header: &str) -> Vec<(String, f32)> {
    let mut entries: Vec<(String, f32)> = header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let value = pieces.next()?.trim().to_string();
            if value.is_empty() {
                return None;
            }
            let q = pieces
                .filter_map(|p| p.trim().strip_prefix("q=")?.parse::<f32>().ok())
                .next()
                .unwrap_or(1.0);
            Some((value, q))
        })
        .collect();
    entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    entries
}

/// Media-type resolution honors `type/*` and `*/*` ranges.
fn choose_media_type(accept: Option<&str>, available: Vec<&str>) -> Option<String> {
    let accept = accept?;
    for (wanted, _q) in accept_order(accept) {
        for value in &available {
            if media_type_matches(&wanted, value) {
                return Some((*value).to_string());
            }
        }
    }
    None
}

fn media_type_matches(wanted: &str, available: &str) -> bool {
    if wanted == "*/*" || wanted == available {
        return true;
    }
    match (wanted.split_once('/'), available.split_once('/')) {
        (Some((wk, "*")), Some((ak, _))) => wk == ak,
        _ => false,
    }
}

/// Plain list resolution for languages and encodings.
fn choose_by_preference(
    header: Option<&str>,
    available: Vec<&str>,
    normalize: impl Fn(&str) -> String,
) -> Option<String> {
    let header = header?;
    for (wanted, _q) in accept_order(header) {
        let wanted = normalize(&wanted);
        for value in &available {
            if *value == wanted {
                return Some((*value).to_string());
            }
        }
        // `fr-FR` falls back to `fr`.
        if let Some(primary) = wanted.split(['-', '_']).next() {
            for value in &available {
                if *value == primary {
                    return Some((*value).to_string());
                }
            }
        }
    }
    None
}

fn normalize_language(tag: &str) -> String {
    tag.to_ascii_lowercase()
}

fn merge_headers(a: &Option<String>, b: &Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => Some(format!("{a},{b}")),
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

// =============================================================================
// Resource Index
// =============================================================================

/// All representation bundles of one branch, keyed by resource path
/// (the parent directory, `""` for the root).
#[derive(Debug, Clone, Default)]
pub struct ResourceIndex {
    bundles: HashMap<String, Bundle>,
}

impl ResourceIndex {
    /// Index a tracked-file listing.
    pub fn build<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bundles: HashMap<String, Bundle> = HashMap::new();
        for path in paths {
            let path = path.as_ref();
            if let Some(rep) = Representation::parse(path) {
                let resource = parent_resource_path(path);
                bundles.entry(resource).or_default().push(rep);
            }
        }
        Self { bundles }
    }

    pub fn bundle(&self, resource: &str) -> Option<&Bundle> {
        self.bundles.get(resource)
    }

    pub fn has_groups(&self) -> bool {
        self.bundles.values().any(Bundle::has_groups)
    }

    /// Whether `path` is the representation the request would be served
    /// for its resource. Paths outside any bundle are trivially
    /// preferred.
    pub fn is_preferred_path(
        &self,
        path: &str,
        headers: &NegotiationHeaders,
        user_groups: &[String],
    ) -> bool {
        let resource = parent_resource_path(path);
        match self.bundles.get(&resource) {
            Some(bundle) if Representation::parse(path).is_some() => bundle
                .choose(headers, user_groups)
                .is_some_and(|rep| rep.path == path),
            _ => true,
        }
    }
}

/// Strip the `index.*` filename, yielding the resource path.
pub fn parent_resource_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, basename)) if basename.starts_with("index.") => dir.to_string(),
        None if path.starts_with("index.") => String::new(),
        _ => path.to_string(),
    }
}

// =============================================================================
// Negotiator
// =============================================================================

/// Branch-level negotiator with a cached resource index.
pub struct Negotiator {
    vcr: GitAdapter,
    cache: CachingDedup<String, Arc<ResourceIndex>, NegotiatorError>,
}

impl Negotiator {
    pub fn new(vcr: GitAdapter) -> Self {
        Self {
            vcr,
            cache: CachingDedup::new(CachingDedupConfig { capacity: 256 }),
        }
    }

    /// The resource index of the request's branch.
    pub async fn resources(&self, ctx: &RequestContext) -> Result<Arc<ResourceIndex>> {
        let vcr = self.vcr.clone();
        let repo_path = ctx.repo_path.clone();
        let branch = ctx.branch.clone();
        self.cache
            .run(ctx.key.clone(), || async move {
                let head = vcr
                    .head_commit(&repo_path, &branch)
                    .await?
                    .ok_or_else(|| NegotiatorError::NoBranch(branch.clone()))?;
                let mut listing = Vec::new();
                vcr.list_tracked_files(&repo_path, &head.id, &mut listing)
                    .await?;
                let text = String::from_utf8_lossy(&listing);
                Ok(Arc::new(ResourceIndex::build(text.lines())))
            })
            .await
    }

    /// Resolve a request path to the representation to serve.
    ///
    /// Empty paths and trailing slashes are directory references; a
    /// path naming a resource with a bundle negotiates, everything else
    /// passes through unchanged.
    pub async fn representation_path(
        &self,
        ctx: &RequestContext,
        headers: &NegotiationHeaders,
        request_path: &str,
    ) -> Result<String> {
        let index = self.resources(ctx).await?;
        let user_groups: Vec<String> = ctx
            .auth
            .as_deref()
            .map(|auth| auth.user_info.groups.clone())
            .unwrap_or_default();

        let path = request_path.trim_start_matches('/');
        let (resource, fallback) = if path.is_empty() {
            (String::new(), "index.html".to_string())
        } else if let Some(dir) = path.strip_suffix('/') {
            (dir.to_string(), format!("{dir}/index.html"))
        } else if index.bundle(path).is_some() {
            (path.to_string(), format!("{path}/index.html"))
        } else {
            let resource = parent_resource_path(path);
            (resource, path.to_string())
        };

        match index.bundle(&resource) {
            Some(bundle) => Ok(bundle
                .choose(headers, &user_groups)
                .map(|rep| rep.path.clone())
                .unwrap_or(fallback)),
            None => Ok(fallback),
        }
    }

    /// Cache key for a negotiation decision: the accept headers plus
    /// the ACM group when capability groups participate.
    pub async fn context_key(
        &self,
        ctx: &RequestContext,
        headers: &NegotiationHeaders,
    ) -> Result<String> {
        let index = self.resources(ctx).await?;
        let mut key = headers.concat();
        if index.has_groups() {
            key.push(':');
            key.push_str(ctx.group());
        }
        Ok(key)
    }

    /// Drop the cached index for one request key.
    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(&key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_representation_attributes() {
        let rep = Representation::parse("page/index.fr.html").unwrap();
        assert_eq!(rep.media_type.as_deref(), Some("text/html"));
        assert_eq!(rep.language.as_deref(), Some("fr"));
        assert!(rep.group.is_none());

        let rep = Representation::parse("index.staff.html").unwrap();
        assert_eq!(rep.group.as_deref(), Some("staff"));

        let rep = Representation::parse("index.utf-8.txt").unwrap();
        assert_eq!(rep.encoding.as_deref(), Some("utf-8"));

        assert!(Representation::parse("page/other.html").is_none());
        assert!(Representation::parse("page/index").is_none());
    }

    #[test]
    fn representation_key_uses_wildcards() {
        let rep = Representation::parse("index.html").unwrap();
        assert_eq!(
            rep.key(),
            ["text/html".to_string(), "*".into(), "*".into(), "*".into()]
        );
    }

    #[test]
    fn parent_resource_strips_index_only() {
        assert_eq!(parent_resource_path("page/index.html"), "page");
        assert_eq!(parent_resource_path("index.html"), "");
        assert_eq!(parent_resource_path("page/other.html"), "page/other.html");
    }

    fn sample_index() -> ResourceIndex {
        ResourceIndex::build([
            "page/index.html",
            "page/index.fr.html",
            "index.html",
            "img/logo.png",
        ])
    }

    fn headers(accept_language: &str) -> NegotiationHeaders {
        NegotiationHeaders {
            accept: Some("text/html".to_string()),
            accept_language: Some(accept_language.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn language_negotiation_picks_matching_rep() {
        let index = sample_index();
        let bundle = index.bundle("page").unwrap();

        let fr = bundle.choose(&headers("fr"), &[]).unwrap();
        assert_eq!(fr.path, "page/index.fr.html");

        let de = bundle.choose(&headers("de"), &[]).unwrap();
        assert_eq!(de.path, "page/index.html");
    }

    #[test]
    fn regional_tag_falls_back_to_primary() {
        let index = sample_index();
        let bundle = index.bundle("page").unwrap();
        let rep = bundle.choose(&headers("fr-FR,en;q=0.5"), &[]).unwrap();
        assert_eq!(rep.path, "page/index.fr.html");
    }

    #[test]
    fn group_negotiation_requires_membership() {
        let index = ResourceIndex::build(["area/index.html", "area/index.staff.html"]);
        let bundle = index.bundle("area").unwrap();

        let public = bundle.choose(&headers("en"), &[]).unwrap();
        assert_eq!(public.path, "area/index.html");

        let staff = bundle
            .choose(&headers("en"), &["staff".to_string()])
            .unwrap();
        assert_eq!(staff.path, "area/index.staff.html");
    }

    #[test]
    fn choose_round_trips_key() {
        let index = sample_index();
        let bundle = index.bundle("page").unwrap();
        let target = Representation::parse("page/index.fr.html").unwrap();
        let headers = NegotiationHeaders {
            accept: Some(target.key()[0].clone()),
            accept_language: Some(target.key()[1].clone()),
            ..Default::default()
        };
        assert_eq!(bundle.choose(&headers, &[]).unwrap(), &target);
    }

    #[test]
    fn preferred_path_predicate() {
        let index = sample_index();
        let headers = headers("fr");
        assert!(index.is_preferred_path("page/index.fr.html", &headers, &[]));
        assert!(!index.is_preferred_path("page/index.html", &headers, &[]));
        // Outside any bundle: trivially preferred.
        assert!(index.is_preferred_path("img/logo.png", &headers, &[]));
    }

    #[test]
    fn accept_order_respects_q_values() {
        let order = accept_order("text/plain;q=0.4, text/html, */*;q=0.1");
        assert_eq!(order[0].0, "text/html");
        assert_eq!(order[1].0, "text/plain");
        assert_eq!(order[2].0, "*/*");
    }

    #[test]
    fn media_ranges_match() {
        assert!(media_type_matches("text/*", "text/html"));
        assert!(media_type_matches("*/*", "image/png"));
        assert!(!media_type_matches("text/*", "image/png"));
    }
}
