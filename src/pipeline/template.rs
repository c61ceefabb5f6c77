//! Path template interpolation.
//!
//! Templates name cache files: `internal/{ctx.account}/{ctx.repo}/
//! records-{commit}.jsonl`. Every `{var}` is replaced from [`Vars`];
//! an unknown variable is an error rather than an empty segment, since
//! a silently collapsed segment would alias distinct cache entries.

use super::{PipelineError, Result, Vars};

/// Interpolate `{var}` references in `template` from `vars`.
///
/// Values may contain `/` (the `commitPath` variable does, on purpose)
/// but never a `..` segment or a leading `/`; either would let a value
/// escape the cache root.
pub fn interpolate(template: &str, vars: &Vars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| PipelineError::MissingVar(after.to_string()))?;
        let name = &after[..end];
        let value = vars
            .get(name)
            .ok_or_else(|| PipelineError::MissingVar(name.to_string()))?;
        if !is_safe_value(value) {
            return Err(PipelineError::UnsafeValue(name.to_string()));
        }
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn is_safe_value(value: &str) -> bool {
    !value.starts_with('/') && !value.split('/').any(|segment| segment == "..")
}
