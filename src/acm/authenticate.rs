//! Authentication method dispatch.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::settings::AuthSettings;
use super::{AcmError, Result};

/// The authenticated (or anonymous) caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user: String,
    pub authenticated: bool,
    pub groups: Vec<String>,
}

impl AuthUser {
    pub fn anonymous() -> Self {
        Self {
            user: "anonymous".to_string(),
            authenticated: false,
            groups: vec![],
        }
    }
}

/// Authenticate a request against the repo's auth settings.
///
/// `authorization` is the raw `Authorization` header. A secure context
/// with no credentials yields [`AcmError::AuthRequired`]; bad
/// credentials yield [`AcmError::AuthFailed`].
pub fn authenticate(
    settings: &AuthSettings,
    secure: bool,
    authorization: Option<&str>,
) -> Result<AuthUser> {
    match settings.method.as_str() {
        "basic" => basic(settings, secure, authorization),
        "test" => test(settings, secure, authorization),
        "none" => Ok(AuthUser::anonymous()),
        other => Err(AcmError::UnknownMethod(other.to_string())),
    }
}

fn basic(settings: &AuthSettings, secure: bool, authorization: Option<&str>) -> Result<AuthUser> {
    let header = match authorization {
        Some(header) => header,
        None if secure => {
            return Err(AcmError::AuthRequired {
                realm: settings.realm.clone(),
            });
        }
        None => return Ok(AuthUser::anonymous()),
    };

    let failed = || AcmError::AuthFailed {
        realm: settings.realm.clone(),
    };

    let encoded = header.strip_prefix("Basic ").ok_or_else(failed)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| failed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| failed())?;
    let (user, password) = decoded.split_once(':').ok_or_else(failed)?;

    let entry = settings.users.get(user).ok_or_else(failed)?;
    if entry.password != password {
        return Err(failed());
    }
    Ok(AuthUser {
        user: user.to_string(),
        authenticated: true,
        groups: entry.groups.clone(),
    })
}

/// Test adapter: `Authorization: Test <user>[:group,group…]` constructs
/// and returns that user.
fn test(settings: &AuthSettings, secure: bool, authorization: Option<&str>) -> Result<AuthUser> {
    let header = match authorization {
        Some(header) => header,
        None if secure => {
            return Err(AcmError::AuthRequired {
                realm: settings.realm.clone(),
            });
        }
        None => return Ok(AuthUser::anonymous()),
    };
    let spec = header.strip_prefix("Test ").unwrap_or(header).trim();
    let (user, groups) = match spec.split_once(':') {
        Some((user, groups)) => (
            user,
            groups
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        None => (spec, vec![]),
    };
    Ok(AuthUser {
        user: user.to_string(),
        authenticated: true,
        groups,
    })
}
