use serde::{Deserialize, Serialize};

use crate::error::CuaError;

/// Environment variable consulted when neither layer carries an API key.
pub const API_KEY_ENV: &str = "SCRAPYBARA_API_KEY";
/// Instance lifetime used when no layer sets one.
pub const DEFAULT_TIMEOUT_HOURS: f64 = 1.0;
/// Longest instance lifetime the device service accepts.
pub const MAX_TIMEOUT_HOURS: f64 = 24.0;

/// One layer of configurable fields. Unset fields fall through to the next layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigLayer {
    #[serde(default)]
    pub scrapybara_api_key: Option<String>,
    #[serde(default)]
    pub timeout_hours: Option<f64>,
    #[serde(default)]
    pub auth_state_id: Option<String>,
}

/// Configuration for one invocation: explicit per-call fields over
/// thread-level fields, with the process environment as the last resort for
/// the API key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub call: ConfigLayer,
    #[serde(default)]
    pub thread: ConfigLayer,
}

/// Fully resolved and validated configuration for one invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedConfig {
    pub api_key: Option<String>,
    pub timeout_hours: f64,
    pub auth_state_id: Option<String>,
}

impl ResolvedConfig {
    /// The API key, or a `Configuration` error when no layer provided one.
    pub fn require_api_key(&self) -> Result<&str, CuaError> {
        self.api_key.as_deref().ok_or_else(CuaError::missing_api_key)
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_ref().filter(|s| !s.trim().is_empty()).cloned()
}

impl RunConfig {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.call.scrapybara_api_key = Some(key.into());
        self
    }

    /// Auth state to restore, per layer precedence. Unlike `resolve`, this
    /// never fails.
    pub fn auth_state_id(&self) -> Option<String> {
        non_empty(&self.call.auth_state_id).or_else(|| non_empty(&self.thread.auth_state_id))
    }

    pub fn resolve(&self) -> Result<ResolvedConfig, CuaError> {
        self.resolve_with(|k| std::env::var(k).ok())
    }

    /// Resolves with an injected environment lookup.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<ResolvedConfig, CuaError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = non_empty(&self.call.scrapybara_api_key)
            .or_else(|| non_empty(&self.thread.scrapybara_api_key))
            .or_else(|| non_empty(&lookup(API_KEY_ENV)));

        let timeout_hours = self
            .call
            .timeout_hours
            .or(self.thread.timeout_hours)
            .unwrap_or(DEFAULT_TIMEOUT_HOURS);
        if !(timeout_hours > 0.0 && timeout_hours <= MAX_TIMEOUT_HOURS) {
            return Err(CuaError::Configuration(format!(
                "timeout_hours must be in (0, {}], got {}",
                MAX_TIMEOUT_HOURS, timeout_hours
            )));
        }

        Ok(ResolvedConfig { api_key, timeout_hours, auth_state_id: self.auth_state_id() })
    }
}
