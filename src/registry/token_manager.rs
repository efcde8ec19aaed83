//! Per-repository authorization cache with single-flight refresh
//!
//! A registry answers the first unauthenticated request with a challenge.
//! The challenge is remembered for the host and every repository gets its
//! own scoped token. Concurrent 401s for the same repository trigger one
//! token exchange; the losers reuse the winner's header.

use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::auth::{Auth, AuthChallenge, AuthHeader};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct TokenManager {
    auth: Auth,
    actions: String,
    challenge: Arc<RwLock<Option<AuthChallenge>>>,
    headers: Arc<RwLock<HashMap<String, AuthHeader>>>,
    refresh_lock: Arc<Mutex<()>>,
    output: Logger,
}

impl TokenManager {
    /// `actions` is the scope requested for every repository, e.g. `pull`
    /// or `pull,push`
    pub fn new(auth: Auth, actions: &str, output: Logger) -> Self {
        Self {
            auth,
            actions: actions.to_string(),
            challenge: Arc::new(RwLock::new(None)),
            headers: Arc::new(RwLock::new(HashMap::new())),
            refresh_lock: Arc::new(Mutex::new(())),
            output,
        }
    }

    pub fn set_challenge(&self, challenge: Option<AuthChallenge>) -> Result<()> {
        let mut guard = self.challenge.write().map_err(|_| lock_error("challenge write"))?;
        *guard = challenge;
        Ok(())
    }

    pub fn challenge(&self) -> Result<Option<AuthChallenge>> {
        let guard = self.challenge.read().map_err(|_| lock_error("challenge read"))?;
        Ok(guard.clone())
    }

    /// Cached authorization for `repository`
    pub fn header_for(&self, repository: &str) -> Result<Option<AuthHeader>> {
        let guard = self.headers.read().map_err(|_| lock_error("token read"))?;
        Ok(guard.get(repository).cloned())
    }

    /// Establish authorization for `repository` before the first request,
    /// when the host is already known to require it
    pub async fn ensure(&self, repository: &str) -> Result<Option<AuthHeader>> {
        if let Some(header) = self.header_for(repository)? {
            return Ok(Some(header));
        }
        if self.challenge()?.is_none() {
            return Ok(None);
        }
        self.reauthenticate(repository, None, None).await
    }

    /// Obtain fresh authorization after `failed` was rejected.
    ///
    /// `challenge` is the challenge carried by the rejection, if any; it
    /// replaces the stored one. When another task already replaced the
    /// rejected header, that header is returned without a new exchange.
    pub async fn reauthenticate(
        &self,
        repository: &str,
        failed: Option<&AuthHeader>,
        challenge: Option<AuthChallenge>,
    ) -> Result<Option<AuthHeader>> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.header_for(repository)?;
        if current.is_some() && current.as_ref() != failed {
            return Ok(current);
        }

        if let Some(challenge) = challenge {
            self.set_challenge(Some(challenge))?;
        }
        let Some(challenge) = self.challenge()? else {
            return Err(RegistryError::AuthRequired(format!(
                "Registry rejected request for {} without an authentication challenge",
                repository
            )));
        };

        self.output.detail(&format!(
            "Authenticating for {} ({}) as {}",
            repository,
            self.actions,
            self.auth
                .credential()
                .principal
                .as_deref()
                .unwrap_or("anonymous")
        ));

        let header = self
            .auth
            .authenticate(&challenge, repository, &self.actions)
            .await?;

        let mut guard = self.headers.write().map_err(|_| lock_error("token write"))?;
        match &header {
            Some(header) => {
                guard.insert(repository.to_string(), header.clone());
            }
            None => {
                guard.remove(repository);
            }
        }
        Ok(header)
    }
}

fn lock_error(which: &str) -> RegistryError {
    RegistryError::Io(format!("Failed to acquire {} lock", which))
}
