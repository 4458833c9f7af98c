use std::hash::{Hash, Hasher};

use axum::http::HeaderMap;

use tally_core::sync::USER_HEADER;

use crate::config::AppConfig;
use crate::error::AppError;

/// Identity attached to a request once it passes the auth middleware
#[derive(Debug, Clone)]
pub struct SyncUser {
    pub user_id: String,
}

/// Check the bearer token and resolve which user the request acts for
///
/// The API trusts a single shared token; per-user identity rides in the
/// `x-tally-user` header set by the client.
pub fn authenticate(headers: &HeaderMap, config: &AppConfig) -> Result<SyncUser, AppError> {
    let token = extract_bearer_token(headers)?;
    if token != config.api_token {
        return Err(AppError::unauthorized("API token is not valid"));
    }

    let user_id = headers
        .get(USER_HEADER)
        .ok_or_else(|| AppError::unauthorized(format!("Missing {USER_HEADER} header")))?
        .to_str()
        .map_err(|_| AppError::unauthorized(format!("{USER_HEADER} header is not valid UTF-8")))?
        .trim();

    if user_id.is_empty() {
        return Err(AppError::unauthorized(format!(
            "{USER_HEADER} header is empty"
        )));
    }
    if user_id.len() > 128 {
        return Err(AppError::unauthorized(format!(
            "{USER_HEADER} header is too long"
        )));
    }

    Ok(SyncUser {
        user_id: user_id.to_string(),
    })
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

/// Stable hash for log lines; raw user ids never reach the logs
pub fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use axum::http::HeaderValue;

    use super::*;

    fn test_config() -> AppConfig {
        AppConfig {
            bind_addr: "127.0.0.1:8080".to_string(),
            api_token: "secret-token".to_string(),
            db_path: PathBuf::from("tally-sync.db"),
            entity_types: vec!["activity".to_string()],
            max_pull_limit: 500,
            rate_limit_window: Duration::from_secs(60),
            push_rate_limit_per_window: 120,
            pull_rate_limit_per_window: 240,
        }
    }

    fn headers(token: &str, user: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        if let Some(user) = user {
            headers.insert(USER_HEADER, HeaderValue::from_str(user).unwrap());
        }
        headers
    }

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );

        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn bearer_token_extractor_rejects_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn authenticate_accepts_matching_token_and_user() {
        let config = test_config();
        let user = authenticate(&headers("secret-token", Some("alice")), &config).unwrap();
        assert_eq!(user.user_id, "alice");
    }

    #[test]
    fn authenticate_rejects_wrong_token() {
        let config = test_config();
        assert!(authenticate(&headers("other-token", Some("alice")), &config).is_err());
    }

    #[test]
    fn authenticate_requires_a_user_header() {
        let config = test_config();
        assert!(authenticate(&headers("secret-token", None), &config).is_err());
        assert!(authenticate(&headers("secret-token", Some("  ")), &config).is_err());
    }

    #[test]
    fn user_fingerprint_is_stable_and_not_reversible_text() {
        assert_eq!(user_fingerprint("alice"), user_fingerprint("alice"));
        assert_ne!(user_fingerprint("alice"), user_fingerprint("bob"));
    }
}
