//! Per-request derived groups and filters.
//!
//! Beyond the authenticated user, three request features contribute to
//! the ACM group and record filtering: the `Accept-Language` locale, a
//! `filter` query parameter (include/exclude globs over record paths),
//! and a client-visible-set body describing what the client already
//! holds.

use std::collections::HashMap;

use crate::glob::{Complement, ComplementSpec};
use crate::util::fingerprint_json;

use super::{AcmError, RecordFilter, Result, CVS_GROUP_PREFIX};

/// Raw per-request auth inputs, extracted by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct RequestAuthInput {
    /// `Authorization` header.
    pub authorization: Option<String>,
    /// `Accept-Language` header.
    pub accept_language: Option<String>,
    /// Parsed `filter=` / `filter[includes]=` / `filter[excludes]=`.
    pub filter: Option<ComplementSpec>,
    /// `cvs` body field: file id → version.
    pub cvs: Option<serde_json::Value>,
}

/// Groups and filters derived from request features.
#[derive(Debug, Clone, Default)]
pub struct DerivedAuth {
    pub groups: Vec<String>,
    pub filters: Vec<RecordFilter>,
}

/// Derive extra groups and record filters from the request.
pub fn derive(input: &RequestAuthInput) -> Result<DerivedAuth> {
    let mut derived = DerivedAuth::default();

    if let Some(locale) = input
        .accept_language
        .as_deref()
        .and_then(primary_locale)
    {
        derived.groups.push(format!("Accept-Language:{locale}"));
    }

    if let Some(spec) = &input.filter {
        let group = fingerprint_json(spec).map_err(|e| AcmError::Settings(e.to_string()))?;
        let complement =
            Complement::compile(spec.clone()).map_err(|e| AcmError::Settings(e.to_string()))?;
        derived.groups.push(group);
        derived.filters.push(RecordFilter::Paths(complement));
    }

    if let Some(cvs) = &input.cvs {
        let map = parse_visible_set(cvs)?;
        let group = fingerprint_json(cvs).map_err(|e| AcmError::BadVisibleSet(e.to_string()))?;
        derived.groups.push(format!("{CVS_GROUP_PREFIX}{group}"));
        derived.filters.push(RecordFilter::VisibleSet(map));
    }

    Ok(derived)
}

/// The first language tag of an `Accept-Language` header, normalized to
/// `ll` or `ll_CC`. Wildcards and malformed tags contribute nothing.
fn primary_locale(header: &str) -> Option<String> {
    let tag = header.split(',').next()?.split(';').next()?.trim();
    let tag = tag.replace('-', "_");
    let mut parts = tag.splitn(2, '_');
    let lang = parts.next()?;
    if lang.len() != 2 || !lang.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    match parts.next() {
        Some(region) if region.len() == 2 && region.chars().all(|c| c.is_ascii_alphabetic()) => {
            Some(format!(
                "{}_{}",
                lang.to_ascii_lowercase(),
                region.to_ascii_uppercase()
            ))
        }
        Some(_) => None,
        None => Some(lang.to_ascii_lowercase()),
    }
}

/// A visible set must be a flat object of file id → version string.
fn parse_visible_set(value: &serde_json::Value) -> Result<HashMap<String, String>> {
    let object = value
        .as_object()
        .ok_or_else(|| AcmError::BadVisibleSet("not an object".to_string()))?;
    let mut map = HashMap::with_capacity(object.len());
    for (id, version) in object {
        let version = version
            .as_str()
            .ok_or_else(|| AcmError::BadVisibleSet(format!("non-string version for '{id}'")))?;
        map.insert(id.clone(), version.to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_language_becomes_a_group() {
        let input = RequestAuthInput {
            accept_language: Some("fr-FR,fr;q=0.9,en;q=0.8".to_string()),
            ..Default::default()
        };
        let derived = derive(&input).unwrap();
        assert_eq!(derived.groups, vec!["Accept-Language:fr_FR"]);
        assert!(derived.filters.is_empty());
    }

    #[test]
    fn bare_language_tag_is_accepted() {
        assert_eq!(primary_locale("de"), Some("de".to_string()));
        assert_eq!(primary_locale("pt_br"), Some("pt_BR".to_string()));
        assert_eq!(primary_locale("*"), None);
        assert_eq!(primary_locale("x-klingon"), None);
    }

    #[test]
    fn filter_group_is_fingerprint_of_canonical_spec() {
        let spec = ComplementSpec {
            includes: vec!["docs/*".to_string()],
            excludes: vec![],
        };
        let input = RequestAuthInput {
            filter: Some(spec.clone()),
            ..Default::default()
        };
        let derived = derive(&input).unwrap();
        assert_eq!(derived.groups, vec![fingerprint_json(&spec).unwrap()]);
        assert_eq!(derived.filters.len(), 1);
    }

    #[test]
    fn equal_filters_share_a_group() {
        let make = |spec: ComplementSpec| {
            derive(&RequestAuthInput {
                filter: Some(spec),
                ..Default::default()
            })
            .unwrap()
            .groups
        };
        let spec = ComplementSpec {
            includes: vec!["a/*".to_string()],
            excludes: vec!["a/x".to_string()],
        };
        assert_eq!(make(spec.clone()), make(spec));
    }

    #[test]
    fn cvs_derives_prefixed_group_and_filter() {
        let input = RequestAuthInput {
            cvs: Some(serde_json::json!({"a.html": "c1"})),
            ..Default::default()
        };
        let derived = derive(&input).unwrap();
        assert_eq!(derived.groups.len(), 1);
        assert!(derived.groups[0].starts_with(CVS_GROUP_PREFIX));
        assert!(matches!(derived.filters[0], RecordFilter::VisibleSet(_)));
    }

    #[test]
    fn malformed_cvs_is_rejected() {
        let input = RequestAuthInput {
            cvs: Some(serde_json::json!(["not", "a", "map"])),
            ..Default::default()
        };
        assert!(matches!(
            derive(&input),
            Err(AcmError::BadVisibleSet(_))
        ));
    }
}
