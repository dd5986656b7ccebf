//! Client credential diagnostics.
//!
//! The proxy serves public mirrors and never forwards client credentials, but
//! Git clients often send `Authorization: Basic` anyway.  The decoded user is
//! attached to the request span so operators can tell clients apart; tokens
//! sent in the user field are shortened first.

use axum::http::{header, HeaderMap};
use base64::Engine as _;

/// Number of leading characters kept from a token-like user name.
const TOKEN_PREFIX_CHARS: usize = 5;

/// Decoded `Authorization: Basic` credentials.
pub struct BasicAuth {
    user: String,
    password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("user", &self.safe_username())
            .finish_non_exhaustive()
    }
}

impl BasicAuth {
    /// Parse an `Authorization` header value.  Returns `None` for any other
    /// scheme or malformed credentials.
    pub fn from_authorization(value: &str) -> Option<Self> {
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// A user name that is safe to log.
    ///
    /// OAuth tokens are commonly sent as the user, with an empty password, a
    /// copy of the token, or a password mentioning `oauth`.  Such user names
    /// are cut down to a short prefix.
    pub fn safe_username(&self) -> String {
        let token_like = self.password.is_empty()
            || self.password == self.user
            || self.password.contains("oauth");
        if token_like && self.user.chars().count() > TOKEN_PREFIX_CHARS {
            let prefix: String = self.user.chars().take(TOKEN_PREFIX_CHARS).collect();
            format!("{prefix}...")
        } else {
            self.user.clone()
        }
    }
}

/// The loggable client user for a request, if it sent Basic credentials.
pub fn client_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    BasicAuth::from_authorization(value).map(|auth| auth.safe_username())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(credentials: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        )
    }

    #[test]
    fn parses_basic_auth() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==".parse().unwrap(),
        );
        assert_eq!(client_user(&headers).as_deref(), Some("Aladdin"));
    }

    #[test]
    fn shortens_token_like_users() {
        let token = "MTQ0NjJkZmQ5OTM2NDE1ZTZjNGZmZjI3";
        for credentials in [
            format!("{token}:"),
            format!("{token}:{token}"),
            format!("{token}:x-oauth-basic"),
        ] {
            let auth = BasicAuth::from_authorization(&basic(&credentials)).unwrap();
            assert_eq!(auth.safe_username(), "MTQ0N...");
        }
    }

    #[test]
    fn short_users_are_kept() {
        let auth = BasicAuth::from_authorization(&basic("bob:")).unwrap();
        assert_eq!(auth.safe_username(), "bob");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let auth = BasicAuth::from_authorization(&basic("ééééééé:")).unwrap();
        assert_eq!(auth.safe_username(), "ééééé...");
    }

    #[test]
    fn malformed_headers_are_ignored() {
        assert!(BasicAuth::from_authorization("Bearer abc").is_none());
        assert!(BasicAuth::from_authorization("Basic !!!").is_none());
        assert!(BasicAuth::from_authorization(&basic("no-colon")).is_none());
        assert!(client_user(&HeaderMap::new()).is_none());
    }

    #[test]
    fn debug_output_hides_password() {
        let auth = BasicAuth::from_authorization(&basic("alice:hunter2")).unwrap();
        let rendered = format!("{auth:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }
}
