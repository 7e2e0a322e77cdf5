//! Named admission policies.
//!
//! A policy binds a window length, a quota and an identifier strategy to a
//! class of routes. Policies are process configuration: the built-in catalog
//! can be extended or overridden from YAML, but is read-only once requests
//! are being served.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::identifier::IdentifierStrategy;
use crate::error::{Result, TollgateError};

/// Login and token endpoints.
pub const AUTH_STRICT: &str = "auth-strict";
/// Account creation.
pub const REGISTRATION: &str = "registration";
/// Everything else.
pub const GENERAL: &str = "general";
/// Destructive or account-level operations.
pub const SENSITIVE: &str = "sensitive";

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// A validated admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: String,
    window: Duration,
    quota: u64,
    strategy: IdentifierStrategy,
    message: String,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
}

impl Policy {
    /// Create a policy, rejecting a zero quota or an empty window.
    pub fn new(
        name: impl Into<String>,
        window: Duration,
        quota: u64,
        strategy: IdentifierStrategy,
    ) -> Result<Self> {
        let name = name.into();

        if quota == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}' must allow at least one request",
                name
            )));
        }
        if window.as_millis() == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}' needs a window of at least 1ms",
                name
            )));
        }

        Ok(Self {
            name,
            window,
            quota,
            strategy,
            message: "Too many requests, please try again later.".to_string(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        })
    }

    /// Set the message returned with rejections.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Give back the slot of requests that end with a status below 400.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Give back the slot of requests that end with a status of 400 or above.
    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    pub fn strategy(&self) -> IdentifierStrategy {
        self.strategy
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a response with `status` should be given back to the quota.
    pub fn refunds_status(&self, status: u16) -> bool {
        if status < 400 {
            self.skip_successful_requests
        } else {
            self.skip_failed_requests
        }
    }
}

/// Serialized form of a policy in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests allowed per window
    pub quota: u64,
    /// Identifier strategy
    #[serde(default = "default_strategy")]
    pub strategy: IdentifierStrategy,
    /// Rejection message
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default)]
    pub skip_failed_requests: bool,
}

fn default_strategy() -> IdentifierStrategy {
    IdentifierStrategy::Hybrid
}

impl PolicyConfig {
    /// Validate into a [`Policy`] named `name`.
    pub fn to_policy(&self, name: &str) -> Result<Policy> {
        let mut policy = Policy::new(
            name,
            Duration::from_millis(self.window_ms),
            self.quota,
            self.strategy,
        )?
        .skip_successful_requests(self.skip_successful_requests)
        .skip_failed_requests(self.skip_failed_requests);

        if let Some(ref message) = self.message {
            policy = policy.with_message(message.clone());
        }

        Ok(policy)
    }
}

/// Catalog document: a map of policy name to policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
}

/// The set of named policies available to routes.
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in policies.
    pub fn builtin() -> Self {
        let builtins = [
            Policy::new(
                AUTH_STRICT,
                Duration::from_millis(15 * MINUTE_MS),
                5,
                IdentifierStrategy::Ip,
            )
            .map(|p| {
                p.with_message("Too many authentication attempts, please try again later.")
                    .skip_successful_requests(true)
            }),
            Policy::new(
                REGISTRATION,
                Duration::from_millis(HOUR_MS),
                3,
                IdentifierStrategy::Ip,
            )
            .map(|p| p.with_message("Too many accounts created, please try again later.")),
            Policy::new(
                GENERAL,
                Duration::from_millis(15 * MINUTE_MS),
                100,
                IdentifierStrategy::Hybrid,
            )
            .map(|p| p.with_message("Too many requests, please try again later.")),
            Policy::new(
                SENSITIVE,
                Duration::from_millis(HOUR_MS),
                10,
                IdentifierStrategy::Token,
            )
            .map(|p| p.with_message("Too many sensitive operations, please try again later.")),
        ];

        let mut catalog = Self::new();
        for policy in builtins.into_iter().flatten() {
            catalog.insert(policy);
        }
        catalog
    }

    /// Built-in policies with `overrides` layered on top.
    pub fn with_overrides(overrides: &HashMap<String, PolicyConfig>) -> Result<Self> {
        let mut catalog = Self::builtin();
        for (name, config) in overrides {
            catalog.insert(config.to_policy(name)?);
        }
        Ok(catalog)
    }

    /// Load a catalog document from a YAML file, on top of the built-ins.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy catalog");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a catalog document from YAML, on top of the built-ins.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: CatalogConfig = serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::Config(format!("Failed to parse policy catalog: {}", e))
        })?;
        Self::with_overrides(&document.policies)
    }

    /// Add or replace a policy.
    pub fn insert(&mut self, policy: Policy) {
        self.policies
            .insert(policy.name().to_string(), Arc::new(policy));
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(name).cloned()
    }

    /// Look up a policy that must exist.
    pub fn require(&self, name: &str) -> Result<Arc<Policy>> {
        self.get(name)
            .ok_or_else(|| TollgateError::Config(format!("unknown policy '{}'", name)))
    }

    /// Names of all policies, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
