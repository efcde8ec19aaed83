//! Credential resolution for registry hosts
//!
//! Resolution is read-only: explicit credentials win, then every
//! [`CredentialStore`] in the keychain is consulted in order, then the
//! registry is accessed anonymously. Persisting a credential is a separate,
//! explicit [`CredentialResolver::login`] call.

use crate::error::{RegistryError, Result};
use crate::image::reference::DEFAULT_REGISTRY;
use crate::logging::Logger;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const DOCKER_HUB_CONFIG_KEY: &str = "https://index.docker.io/v1/";

/// How a credential was obtained
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    Anonymous,
    Basic,
    /// Basic credentials found in the named keychain store
    Keychain(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub registry_host: String,
    pub principal: Option<String>,
    pub secret: Option<String>,
    pub mechanism: Mechanism,
}

impl Credential {
    pub fn anonymous(registry_host: &str) -> Self {
        Credential {
            registry_host: registry_host.to_string(),
            principal: None,
            secret: None,
            mechanism: Mechanism::Anonymous,
        }
    }

    pub fn basic(registry_host: &str, principal: &str, secret: &str) -> Self {
        Credential {
            registry_host: registry_host.to_string(),
            principal: Some(principal.to_string()),
            secret: Some(secret.to_string()),
            mechanism: Mechanism::Basic,
        }
    }

    /// Username and password, when this credential carries them
    pub fn basic_pair(&self) -> Option<(&str, &str)> {
        match (&self.principal, &self.secret) {
            (Some(principal), Some(secret)) => Some((principal.as_str(), secret.as_str())),
            _ => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.mechanism == Mechanism::Anonymous
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("registry_host", &self.registry_host)
            .field("principal", &self.principal)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// User-supplied principal and secret, either of which may be absent
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ExplicitCredential {
    pub principal: Option<String>,
    pub secret: Option<String>,
}

impl ExplicitCredential {
    pub fn new(principal: Option<String>, secret: Option<String>) -> Self {
        // Unset CI variables often arrive as empty strings
        let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());
        ExplicitCredential {
            principal: non_empty(principal),
            secret: non_empty(secret),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.principal.is_none() && self.secret.is_none()
    }

    /// `Some((principal, secret))` when complete, `None` when absent,
    /// an error when only half of the pair was supplied
    pub fn validate(&self, registry_host: &str) -> Result<Option<(&str, &str)>> {
        match (&self.principal, &self.secret) {
            (Some(principal), Some(secret)) => Ok(Some((principal, secret))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(RegistryError::AuthResolution {
                registry: registry_host.to_string(),
                reason: "principal provided without secret".to_string(),
            }),
            (None, Some(_)) => Err(RegistryError::AuthResolution {
                registry: registry_host.to_string(),
                reason: "secret provided without principal".to_string(),
            }),
        }
    }
}

impl fmt::Debug for ExplicitCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplicitCredential")
            .field("principal", &self.principal)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Read/write access to stored registry credentials
pub trait CredentialStore: Send + Sync {
    fn name(&self) -> &str;

    /// Stored `(principal, secret)` for `registry_host`
    fn get(&self, registry_host: &str) -> Result<Option<(String, String)>>;

    fn store(&self, registry_host: &str, principal: &str, secret: &str) -> Result<()>;
}

/// Process-level keychain held in memory
pub struct MemoryCredentialStore {
    name: String,
    entries: RwLock<HashMap<String, (String, String)>>,
}

impl MemoryCredentialStore {
    pub fn new(name: &str) -> Self {
        MemoryCredentialStore {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new("process-keychain")
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, registry_host: &str) -> Result<Option<(String, String)>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RegistryError::Io("Failed to acquire keychain read lock".to_string()))?;
        Ok(entries.get(&normalize_host(registry_host)).cloned())
    }

    fn store(&self, registry_host: &str, principal: &str, secret: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RegistryError::Io("Failed to acquire keychain write lock".to_string()))?;
        entries.insert(
            normalize_host(registry_host),
            (principal.to_string(), secret.to_string()),
        );
        Ok(())
    }
}

/// The `auths` section of a Docker CLI `config.json`
pub struct DockerConfigStore {
    path: PathBuf,
}

impl DockerConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DockerConfigStore { path: path.into() }
    }

    /// `$DOCKER_CONFIG/config.json`, else `$HOME/.docker/config.json`
    pub fn from_env() -> Option<Self> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG").filter(|d| !d.is_empty()) {
            return Some(Self::new(PathBuf::from(dir).join("config.json")));
        }
        std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(|home| Self::new(PathBuf::from(home).join(".docker").join("config.json")))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn load(&self) -> Result<serde_json::Value> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::json!({})),
            Err(e) => Err(RegistryError::Io(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn decode_entry(entry: &serde_json::Value) -> Result<Option<(String, String)>> {
        if let Some(auth) = entry.get("auth").and_then(|a| a.as_str()).filter(|a| !a.is_empty()) {
            let decoded = BASE64
                .decode(auth)
                .map_err(|e| RegistryError::Parse(format!("Invalid auth entry encoding: {}", e)))?;
            let decoded = String::from_utf8(decoded)?;
            let (principal, secret) = decoded
                .split_once(':')
                .ok_or_else(|| RegistryError::Parse("Auth entry is not user:password".into()))?;
            return Ok(Some((principal.to_string(), secret.to_string())));
        }

        let field = |name: &str| entry.get(name).and_then(|v| v.as_str()).map(str::to_string);
        match (field("username"), field("password")) {
            (Some(principal), Some(secret)) if !principal.is_empty() => {
                Ok(Some((principal, secret)))
            }
            _ => Ok(None),
        }
    }
}

impl CredentialStore for DockerConfigStore {
    fn name(&self) -> &str {
        "docker-config"
    }

    fn get(&self, registry_host: &str) -> Result<Option<(String, String)>> {
        let config = self.load()?;
        let Some(auths) = config.get("auths").and_then(|a| a.as_object()) else {
            return Ok(None);
        };

        let wanted = normalize_host(registry_host);
        for (key, entry) in auths {
            if normalize_host(key) == wanted {
                if let Some(pair) = Self::decode_entry(entry)? {
                    return Ok(Some(pair));
                }
            }
        }
        Ok(None)
    }

    fn store(&self, registry_host: &str, principal: &str, secret: &str) -> Result<()> {
        let mut config = self.load()?;
        let root = config
            .as_object_mut()
            .ok_or_else(|| RegistryError::Parse("Docker config is not a JSON object".into()))?;
        let auths = root
            .entry("auths")
            .or_insert_with(|| serde_json::json!({}))
            .as_object_mut()
            .ok_or_else(|| RegistryError::Parse("Docker config auths is not an object".into()))?;

        // Drop aliases so the new entry is the only match for this host
        let wanted = normalize_host(registry_host);
        auths.retain(|key, _| normalize_host(key) != wanted);

        let key = if wanted == DEFAULT_REGISTRY {
            DOCKER_HUB_CONFIG_KEY.to_string()
        } else {
            wanted
        };
        let encoded = BASE64.encode(format!("{}:{}", principal, secret));
        auths.insert(key, serde_json::json!({ "auth": encoded }));

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        // Staged at mode 0600 beside the target, then renamed over it
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            staged
                .as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        staged.write_all(&serde_json::to_vec_pretty(&config)?)?;
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Strip scheme and path, and fold Docker Hub aliases together
fn normalize_host(key: &str) -> String {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = without_scheme.split('/').next().unwrap_or_default();
    match host {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => DEFAULT_REGISTRY.to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Chained credential lookup
pub struct CredentialResolver {
    keychain: Vec<Arc<dyn CredentialStore>>,
    logger: Logger,
}

impl CredentialResolver {
    pub fn new(keychain: Vec<Arc<dyn CredentialStore>>, logger: Logger) -> Self {
        CredentialResolver { keychain, logger }
    }

    /// Resolve how to authenticate against `registry_host`. Never writes.
    pub fn resolve(&self, registry_host: &str, explicit: &ExplicitCredential) -> Result<Credential> {
        if let Some((principal, secret)) = explicit.validate(registry_host)? {
            self.logger.detail(&format!(
                "Using explicit credentials for {} (user: {})",
                registry_host, principal
            ));
            return Ok(Credential::basic(registry_host, principal, secret));
        }

        for store in &self.keychain {
            match store.get(registry_host) {
                Ok(Some((principal, secret))) => {
                    self.logger.detail(&format!(
                        "Found credentials for {} in {}",
                        registry_host,
                        store.name()
                    ));
                    return Ok(Credential {
                        registry_host: registry_host.to_string(),
                        principal: Some(principal),
                        secret: Some(secret),
                        mechanism: Mechanism::Keychain(store.name().to_string()),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    // An unreadable store must not block anonymous access
                    self.logger.warning(&format!(
                        "Skipping credential store {}: {}",
                        store.name(),
                        e
                    ));
                }
            }
        }

        self.logger
            .detail(&format!("No credentials for {}, using anonymous access", registry_host));
        Ok(Credential::anonymous(registry_host))
    }

    /// Persist explicit credentials for `registry_host` into `store`
    pub fn login(
        &self,
        registry_host: &str,
        explicit: &ExplicitCredential,
        store: &dyn CredentialStore,
    ) -> Result<Credential> {
        let (principal, secret) =
            explicit
                .validate(registry_host)?
                .ok_or_else(|| RegistryError::AuthResolution {
                    registry: registry_host.to_string(),
                    reason: "login requires a principal and a secret".to_string(),
                })?;

        store.store(registry_host, principal, secret)?;
        self.logger.info(&format!(
            "Logged in to {} via {}",
            registry_host,
            store.name()
        ));
        Ok(Credential::basic(registry_host, principal, secret))
    }
}
