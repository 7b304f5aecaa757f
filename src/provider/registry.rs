//! Provider routing.
//!
//! Resource types are routed by their package, the segment before the first
//! `:` (`aws` in `aws:lambda:Function`). Types with no dedicated entry go to
//! the `default` provider.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::{DEFAULT_PROVIDER_KEY, ProviderConfig, type_package};
use crate::error::{ConfigError, ConvergeError, Result};

use super::{HttpProvider, LocalProvider, Provider};

/// Routes resource types to providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that sends everything to one provider.
    #[must_use]
    pub fn single(provider: Arc<dyn Provider>) -> Self {
        Self::new().with(DEFAULT_PROVIDER_KEY, provider)
    }

    /// Registers a provider under a package name (or `default`).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(key.into(), provider);
        self
    }

    /// Builds a registry from the stack's `providers` section.
    ///
    /// An empty section yields a single local provider. Bearer tokens are
    /// read from the variables named by `token_env`.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built or a token
    /// variable is unset.
    pub fn from_config(config: &BTreeMap<String, ProviderConfig>) -> Result<Self> {
        if config.is_empty() {
            debug!("No providers configured, using the local provider");
            return Ok(Self::single(Arc::new(LocalProvider::new())));
        }

        let mut registry = Self::new();
        for (key, provider) in config {
            let built: Arc<dyn Provider> = match provider {
                ProviderConfig::Local => Arc::new(LocalProvider::new()),
                ProviderConfig::Http {
                    endpoint,
                    timeout_secs,
                    token_env,
                } => {
                    let mut http = HttpProvider::with_timeout(endpoint, *timeout_secs)?;
                    if let Some(var) = token_env {
                        let token = std::env::var(var).map_err(|_| {
                            ConvergeError::Config(ConfigError::InvalidEnvVar {
                                name: var.clone(),
                                message: format!("token for provider '{key}' is not set"),
                            })
                        })?;
                        http = http.with_token(token);
                    }
                    Arc::new(http)
                }
            };
            debug!("Registered provider '{key}'");
            registry.providers.insert(key.clone(), built);
        }

        Ok(registry)
    }

    /// Finds the provider for a resource type, returning its registry key.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingProvider` if neither the package nor
    /// `default` is registered.
    pub fn resolve(&self, resource_type: &str) -> std::result::Result<(&str, Arc<dyn Provider>), ConfigError> {
        let package = type_package(resource_type);
        self.providers
            .get_key_value(package)
            .or_else(|| self.providers.get_key_value(DEFAULT_PROVIDER_KEY))
            .map(|(key, provider)| (key.as_str(), Arc::clone(provider)))
            .ok_or_else(|| ConfigError::MissingProvider {
                resource_type: resource_type.to_string(),
            })
    }

    /// Returns the registered keys.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}
