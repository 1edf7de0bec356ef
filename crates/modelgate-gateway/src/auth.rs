//! Admin API authentication
//!
//! The admin surface is closed unless a token is configured. Chat endpoints
//! are not gated here; callers authenticate to the gateway's operator, not
//! to the upstream providers.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use tracing::warn;

/// Check the `Authorization: Bearer` header against the admin token.
/// An empty configured token disables the admin API entirely.
pub fn is_admin(admin_token: &str, headers: &HeaderMap) -> bool {
    if admin_token.is_empty() {
        warn!("Admin request rejected: no admin token configured");
        return false;
    }
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    match provided {
        Some(token) => constant_time_eq(admin_token.as_bytes(), token.as_bytes()),
        None => {
            warn!("Admin request rejected: missing bearer token");
            false
        }
    }
}

/// `Bearer <token>` → `<token>`
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let token = header_value.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_admin_disabled_without_token() {
        assert!(!is_admin("", &headers("Bearer anything")));
        assert!(!is_admin("", &HeaderMap::new()));
    }

    #[test]
    fn test_admin_token_match() {
        assert!(is_admin("adm-secret", &headers("Bearer adm-secret")));
        assert!(!is_admin("adm-secret", &headers("Bearer adm-secreT")));
        assert!(!is_admin("adm-secret", &headers("adm-secret")));
        assert!(!is_admin("adm-secret", &HeaderMap::new()));
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(bearer_token("  Bearer  spaced "), Some("spaced"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc123"), None);
    }

    #[test]
    fn test_constant_time_eq_lengths() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
