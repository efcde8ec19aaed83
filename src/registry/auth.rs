//! Authentication negotiation for Docker Registry v2
//!
//! Parses `WWW-Authenticate` challenges and exchanges credentials for
//! bearer tokens at the realm the registry advertises.

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::credentials::Credential;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;

/// Challenge issued by a registry on `401 Unauthorized`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic {
        realm: Option<String>,
    },
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate` header value
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = match header.split_once(char::is_whitespace) {
            Some((scheme, params)) => (scheme, params),
            None => (header, ""),
        };
        let params = parse_params(params);

        if scheme.eq_ignore_ascii_case("bearer") {
            Some(AuthChallenge::Bearer {
                realm: params.get("realm")?.clone(),
                service: params.get("service").cloned(),
                scope: params.get("scope").cloned(),
            })
        } else if scheme.eq_ignore_ascii_case("basic") {
            Some(AuthChallenge::Basic {
                realm: params.get("realm").cloned(),
            })
        } else {
            None
        }
    }
}

/// `key="value", key2=value2` with commas allowed inside quotes
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            for c in chars.by_ref() {
                match c {
                    _ if escaped => {
                        value.push(c);
                        escaped = false;
                    }
                    '\\' => escaped = true,
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        params.insert(key, value);
    }

    params
}

/// Authorization attached to registry requests
#[derive(Clone, PartialEq, Eq)]
pub enum AuthHeader {
    Bearer(String),
    Basic { principal: String, secret: String },
}

impl AuthHeader {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            AuthHeader::Bearer(token) => request.bearer_auth(token),
            AuthHeader::Basic { principal, secret } => request.basic_auth(principal, Some(secret)),
        }
    }
}

impl std::fmt::Debug for AuthHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthHeader::Bearer(token) => write!(f, "Bearer(<{} chars>)", token.len()),
            AuthHeader::Basic { principal, .. } => write!(f, "Basic({})", principal),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// Performs the credential-for-token exchange
#[derive(Clone)]
pub struct Auth {
    client: Client,
    credential: Credential,
    output: Logger,
}

impl Auth {
    pub fn new(client: Client, credential: Credential, output: Logger) -> Self {
        Self {
            client,
            credential,
            output,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Answer `challenge` for `repository` with the given scope actions.
    ///
    /// Returns `None` when the challenge cannot be answered with the
    /// credential at hand, e.g. a Basic challenge for an anonymous client.
    pub async fn authenticate(
        &self,
        challenge: &AuthChallenge,
        repository: &str,
        actions: &str,
    ) -> Result<Option<AuthHeader>> {
        match challenge {
            AuthChallenge::Basic { .. } => Ok(self.credential.basic_pair().map(
                |(principal, secret)| AuthHeader::Basic {
                    principal: principal.to_string(),
                    secret: secret.to_string(),
                },
            )),
            AuthChallenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let scope = if repository.is_empty() {
                    scope.clone()
                } else {
                    Some(format!("repository:{}:{}", repository, actions))
                };
                self.fetch_token(realm, service.as_deref(), scope.as_deref())
                    .await
                    .map(|token| Some(AuthHeader::Bearer(token)))
            }
        }
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> Result<String> {
        let mut url = url::Url::parse(realm)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            if let Some(scope) = scope {
                query.append_pair("scope", scope);
            }
        }

        self.output.detail(&format!("Requesting token from: {}", url));

        let mut request = self.client.get(url.as_str());
        if let Some((principal, secret)) = self.credential.basic_pair() {
            request = request.basic_auth(principal, Some(secret));
        }

        let response = request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "token request"))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_auth_error(status, &error_text));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Parse(format!("Failed to parse token response: {}", e)))?;

        if let Some(expires_in) = token_response.expires_in {
            self.output
                .trace(&format!("Token expires in {} seconds", expires_in));
        }

        token_response
            .token
            .or(token_response.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::AuthRequired("Token response contained no token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:app:pull,push""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            AuthChallenge::Bearer {
                realm: "https://auth.example.com/token".into(),
                service: Some("registry.example.com".into()),
                scope: Some("repository:app:pull,push".into()),
            }
        );
    }

    #[test]
    fn test_parse_basic_and_unquoted() {
        assert_eq!(
            AuthChallenge::parse(r#"Basic realm="Registry Realm""#),
            Some(AuthChallenge::Basic {
                realm: Some("Registry Realm".into())
            })
        );
        assert_eq!(
            AuthChallenge::parse("basic"),
            Some(AuthChallenge::Basic { realm: None })
        );
        assert_eq!(
            AuthChallenge::parse("Bearer realm=https://auth.example.com/token, service=reg"),
            Some(AuthChallenge::Bearer {
                realm: "https://auth.example.com/token".into(),
                service: Some("reg".into()),
                scope: None,
            })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_or_incomplete() {
        assert_eq!(AuthChallenge::parse("Negotiate abc"), None);
        assert_eq!(AuthChallenge::parse(r#"Bearer service="reg""#), None);
    }

    #[test]
    fn test_escaped_quotes_in_params() {
        let params = parse_params(r#"realm="a\"b", scope="x,y""#);
        assert_eq!(params["realm"], "a\"b");
        assert_eq!(params["scope"], "x,y");
    }

    #[test]
    fn test_auth_header_debug_hides_secrets() {
        let header = AuthHeader::Basic {
            principal: "ci-bot".into(),
            secret: "s3cret".into(),
        };
        assert!(!format!("{:?}", header).contains("s3cret"));
        let header = AuthHeader::Bearer("tok".into());
        assert!(!format!("{:?}", header).contains("tok"));
    }
}
