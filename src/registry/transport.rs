//! Authenticated HTTP transport for a single registry host
//!
//! Owns scheme negotiation against `/v2/`, the per-repository token cache
//! and the one-shot re-authentication performed when a request is rejected
//! with `401 Unauthorized`.

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::auth::AuthChallenge;
use crate::registry::token_manager::TokenManager;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::OnceCell;

pub struct RegistryTransport {
    client: Client,
    host: String,
    insecure: bool,
    base_url: OnceCell<String>,
    tokens: TokenManager,
    output: Logger,
}

impl RegistryTransport {
    pub fn new(
        client: Client,
        host: &str,
        insecure: bool,
        tokens: TokenManager,
        output: Logger,
    ) -> Self {
        Self {
            client,
            host: host.to_string(),
            insecure,
            base_url: OnceCell::new(),
            tokens,
            output,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Loopback registries are commonly served over plain HTTP
    fn allows_plain_http(&self) -> bool {
        let hostname = self.host.split(':').next().unwrap_or_default();
        self.insecure || hostname == "localhost" || hostname.starts_with("127.")
    }

    /// `scheme://host`, negotiated once per transport
    pub async fn base_url(&self) -> Result<&str> {
        let base = self.base_url.get_or_try_init(|| self.negotiate()).await?;
        Ok(base.as_str())
    }

    async fn negotiate(&self) -> Result<String> {
        let mut schemes = vec!["https"];
        if self.allows_plain_http() {
            schemes.push("http");
        }

        let mut last_error = None;
        for scheme in schemes {
            let base = format!("{}://{}", scheme, self.host);
            match self.ping(&base).await {
                Ok(()) => {
                    self.output.detail(&format!("Using {} for {}", scheme, self.host));
                    return Ok(base);
                }
                Err(e @ RegistryError::Network(_)) => {
                    self.output
                        .debug(&format!("{} unreachable over {}: {}", self.host, scheme, e));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RegistryError::Network(format!("No usable scheme for {}", self.host))
        }))
    }

    /// `GET /v2/` to check the API version and learn the auth challenge
    async fn ping(&self, base: &str) -> Result<()> {
        let url = format!("{}/v2/", base);
        self.output.trace(&format!("Pinging {}", url));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "registry ping"))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                let challenge = challenge_of(&response);
                if challenge.is_none() {
                    self.output
                        .warning(&format!("{} requires auth but sent no usable challenge", self.host));
                }
                self.tokens.set_challenge(challenge)
            }
            status if status.is_success() => Ok(()),
            status => {
                // Some registries answer /v2/ with 404 yet serve the API
                self.output
                    .debug(&format!("Unexpected /v2/ status {} from {}", status, self.host));
                Ok(())
            }
        }
    }

    /// Send a request built by `build`, re-authenticating once on 401.
    ///
    /// `build` receives the negotiated base URL and may be invoked twice, so
    /// request bodies must be reconstructible.
    pub async fn send<F>(&self, repository: &str, operation: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client, &str) -> Result<RequestBuilder>,
    {
        let base = self.base_url().await?;
        let header = self.tokens.ensure(repository).await?;

        let mut request = build(&self.client, base)?;
        if let Some(header) = &header {
            request = header.apply(request);
        }
        let response = request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, operation))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.output.detail(&format!(
            "{} rejected {} for {}, re-authenticating",
            self.host, operation, repository
        ));
        let challenge = challenge_of(&response);
        let Some(refreshed) = self
            .tokens
            .reauthenticate(repository, header.as_ref(), challenge)
            .await?
        else {
            return Err(self.error_for(response, operation, repository).await);
        };

        let response = refreshed
            .apply(build(&self.client, base)?)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, operation))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.error_for(response, operation, repository).await);
        }
        Ok(response)
    }

    /// Convert an unsuccessful response into an error
    pub async fn error_for(&self, response: Response, operation: &str, subject: &str) -> RegistryError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        self.output.debug(&format!(
            "{} on {} failed with {}: {}",
            operation, subject, status, text
        ));
        HttpErrorHandler::handle_registry_error(status, &text, operation, subject)
    }
}

fn challenge_of(response: &Response) -> Option<AuthChallenge> {
    response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .and_then(AuthChallenge::parse)
}

/// Resolve an upload `Location` header against the registry base URL
pub fn resolve_location(base: &str, location: &str) -> Result<url::Url> {
    let base = url::Url::parse(base)?;
    Ok(base.join(location)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::auth::Auth;
    use crate::registry::credentials::Credential;

    fn transport(host: &str, insecure: bool) -> RegistryTransport {
        let logger = Logger::new_quiet();
        let auth = Auth::new(Client::new(), Credential::anonymous(host), logger.clone());
        let tokens = TokenManager::new(auth, "pull", logger.clone());
        RegistryTransport::new(Client::new(), host, insecure, tokens, logger)
    }

    #[test]
    fn test_plain_http_policy() {
        assert!(!transport("registry.example.com", false).allows_plain_http());
        assert!(transport("registry.example.com", true).allows_plain_http());
        assert!(transport("localhost:5000", false).allows_plain_http());
        assert!(transport("127.0.0.1:5000", false).allows_plain_http());
    }

    #[test]
    fn test_resolve_location() {
        let absolute =
            resolve_location("https://r.example.com", "https://cdn.example.com/upload/abc?x=1")
                .unwrap();
        assert_eq!(absolute.as_str(), "https://cdn.example.com/upload/abc?x=1");

        let relative =
            resolve_location("https://r.example.com", "/v2/app/blobs/uploads/abc?_state=s")
                .unwrap();
        assert_eq!(
            relative.as_str(),
            "https://r.example.com/v2/app/blobs/uploads/abc?_state=s"
        );
    }
}
