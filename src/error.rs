use thiserror::Error;

/// Errors in the user's stored configuration. These are surfaced directly
/// and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown provider type: {0}")]
    UnknownProviderType(String),

    #[error("provider {0:?} not found")]
    ProviderNotFound(String),
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("timed out waiting for the authorization callback")]
    Timeout,

    #[error("authorization denied: {0}")]
    Denied(String),

    #[error("authorization state mismatch")]
    StateMismatch,
}

/// Substrings that identify an expired or invalidated OAuth credential in
/// backend error text. An error matching one of these gets a single
/// re-authentication retry; everything else is terminal.
const AUTH_ERROR_PATTERNS: &[&str] = &[
    "invalid_grant",
    "token has expired",
    "Refresh token has expired",
    "invalid_token",
    "Token expired",
    "unauthorized",
];

pub fn is_auth_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}");
    AUTH_ERROR_PATTERNS.iter().any(|p| text.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_auth_error_detection() {
        assert!(is_auth_error(&anyhow!("oauth2: \"invalid_grant\"")));
        assert!(is_auth_error(&anyhow!("Dropbox upload error: token has expired")));
        assert!(is_auth_error(&anyhow!("401 unauthorized")));
        assert!(is_auth_error(&anyhow!("Refresh token has expired, please re-authenticate")));
    }

    #[test]
    fn test_auth_error_detection_in_context_chain() {
        let err = anyhow!("invalid_token").context("uploading to Box");
        assert!(is_auth_error(&err));
    }

    #[test]
    fn test_non_auth_errors_are_not_matched() {
        assert!(!is_auth_error(&anyhow!("connection refused")));
        assert!(!is_auth_error(&anyhow!("500 internal server error")));
        assert!(!is_auth_error(&anyhow!("folder not found")));
    }
}
