//! Scope guard for handlers that declare required scopes.

use tracing::warn;

use super::{AuthError, VerifiedIdentity};

/// Check that `identity` carries every scope in `required`.
///
/// # Errors
///
/// Returns [`AuthError::InsufficientScope`] listing the missing scopes.
pub fn require_scopes<S: AsRef<str>>(
    identity: &VerifiedIdentity,
    required: &[S],
) -> Result<(), AuthError> {
    let missing: Vec<String> = required
        .iter()
        .map(AsRef::as_ref)
        .filter(|scope| !identity.has_scope(scope))
        .map(str::to_string)
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    warn!(
        subject = %identity.subject,
        missing = ?missing,
        "Request rejected: insufficient scope"
    );
    Err(AuthError::InsufficientScope {
        required: required.iter().map(|s| s.as_ref().to_string()).collect(),
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn identity(scopes: &[&str]) -> VerifiedIdentity {
        VerifiedIdentity {
            subject: "client@clients".into(),
            scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
            claims: Map::new(),
            expires_at: 0,
        }
    }

    #[test]
    fn passes_when_all_present() {
        let id = identity(&["files:read", "files:write"]);
        assert!(require_scopes(&id, &["files:read"]).is_ok());
        assert!(require_scopes(&id, &["files:write", "files:read"]).is_ok());
    }

    #[test]
    fn empty_requirement_always_passes() {
        let id = identity(&[]);
        assert!(require_scopes::<&str>(&id, &[]).is_ok());
    }

    #[test]
    fn reports_only_missing_scopes() {
        let id = identity(&["files:read"]);

        let err = require_scopes(&id, &["files:read", "files:write", "admin"]).unwrap_err();

        match err {
            AuthError::InsufficientScope { required, missing } => {
                assert_eq!(required, vec!["files:read", "files:write", "admin"]);
                assert_eq!(missing, vec!["files:write", "admin"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
