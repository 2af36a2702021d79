//! API key handling
//!
//! The key is read from the environment once, before any network activity,
//! and never printed.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// API key sent as the `x-api-key` header
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Read the key from `env_var`; blank values count as absent
pub fn api_key_from_env(env_var: &str) -> Option<ApiKey> {
    std::env::var(env_var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(ApiKey)
}

/// Pre-flight credential check
///
/// Returns `Ok(None)` when no configured source talks to the remote service.
pub fn resolve_credential(config: &PipelineConfig) -> Result<Option<ApiKey>> {
    if !config.requires_credential() {
        return Ok(None);
    }

    let env_var = &config.settings.api_key_env;
    api_key_from_env(env_var)
        .map(Some)
        .ok_or_else(|| PipelineError::MissingCredential {
            env_var: env_var.clone(),
        })
}
