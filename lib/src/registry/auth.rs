//! Bearer-token authentication against registry token services.
//!
//! A registry that wants authentication answers `401` with a
//! `WWW-Authenticate: Bearer realm="…",service="…",scope="…"` challenge.
//! The client then fetches a token from the realm (with Basic credentials
//! when it has any) and replays the original request with `Bearer <token>`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tracing::debug;

use super::{RegistryError, CLIENT};

/// An `Authorization` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// HTTP basic authentication, already base64-encoded.
    Basic(String),
    /// A bearer token.
    Bearer(String),
}

impl Authorization {
    /// Basic authorization from a username and secret.
    pub fn basic(username: &str, secret: &str) -> Self {
        Self::Basic(BASE64.encode(format!("{username}:{secret}")))
    }

    /// Bearer authorization from a token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    /// The full header value.
    pub fn header_value(&self) -> String {
        match self {
            Authorization::Basic(encoded) => format!("Basic {encoded}"),
            Authorization::Bearer(token) => format!("Bearer {token}"),
        }
    }

    /// Whether this is a bearer token.
    pub fn is_bearer(&self) -> bool {
        matches!(self, Authorization::Bearer(_))
    }
}

/// A parsed `WWW-Authenticate: Bearer …` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// The token endpoint.
    pub realm: String,
    /// The `service` parameter, forwarded to the endpoint.
    pub service: Option<String>,
    /// The `scope` parameter, forwarded verbatim when present.
    pub scope: Option<String>,
}

/// Parse a `WWW-Authenticate` header value.  Returns `None` for non-Bearer
/// schemes or a challenge without a realm.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header
        .trim()
        .strip_prefix("Bearer ")
        .or_else(|| header.trim().strip_prefix("bearer "))?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for param in split_challenge_params(params) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

/// Split on commas that are not inside a quoted value.
fn split_challenge_params(params: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&params[start..]);
    out
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Fetch a bearer token from the challenge's realm.
///
/// `fallback_scope` is used when the challenge did not name one (e.g.
/// `repository:library/app:pull,push`).  Basic credentials, when present,
/// authenticate the token request itself.
pub(crate) async fn fetch_token(
    challenge: &BearerChallenge,
    basic: Option<&Authorization>,
    fallback_scope: &str,
) -> Result<Authorization, RegistryError> {
    let scope = challenge.scope.as_deref().unwrap_or(fallback_scope);
    debug!(realm = %challenge.realm, scope, "fetching bearer token");
    let mut query: Vec<(&str, &str)> = vec![("scope", scope)];
    if let Some(service) = challenge.service.as_deref() {
        query.push(("service", service));
    }
    let mut request = CLIENT.get(&challenge.realm).query(&query);
    if let Some(basic) = basic {
        request = request.header(reqwest::header::AUTHORIZATION, basic.header_value());
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(RegistryError::TokenRequestFailed {
            realm: challenge.realm.clone(),
            status: response.status().as_u16(),
        });
    }
    let token: TokenResponse = response.json().await.map_err(reqwest_middleware::Error::from)?;
    token
        .token
        .or(token.access_token)
        .map(Authorization::bearer)
        .ok_or_else(|| RegistryError::TokenRequestFailed {
            realm: challenge.realm.clone(),
            status: 200,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:library/app:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.example.com"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/app:pull")
        );
    }

    #[test]
    fn test_parse_challenge_quoted_commas() {
        // A scope listing two repositories contains a comma inside quotes
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth/token",scope="repository:a:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scope.as_deref(), Some("repository:a:pull,push"));
    }

    #[test]
    fn test_parse_challenge_rejects_other_schemes() {
        assert!(parse_bearer_challenge(r#"Basic realm="reg""#).is_none());
        assert!(parse_bearer_challenge("Bearer ").is_none());
    }

    #[test]
    fn test_basic_header_value() {
        let auth = Authorization::basic("user", "pass");
        // base64("user:pass")
        assert_eq!(auth.header_value(), "Basic dXNlcjpwYXNz");
        assert!(!auth.is_bearer());
        assert!(Authorization::bearer("T").is_bearer());
        assert_eq!(Authorization::bearer("T").header_value(), "Bearer T");
    }
}
