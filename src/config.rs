//! Configuration for a test cluster.
//!
//! The configuration is an explicit value handed to [`Cluster::new`]; nothing
//! is read from process-wide state unless the caller asks for it through
//! [`ClusterConfig::with_env_overrides`].
//!
//! [`Cluster::new`]: crate::Cluster::new

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Service name of the optional trace-collector remote.
pub const TRACE_COLLECTOR_SERVICE: &str = "tcollector";

/// Environment variable overriding [`ClusterConfig::size`].
pub const ENV_SIZE: &str = "MESH_CLUSTER_SIZE";

/// Environment variable overriding [`ClusterConfig::k_value`].
pub const ENV_K_VALUE: &str = "MESH_CLUSTER_K_VALUE";

/// Environment variable overriding [`ClusterConfig::trace`].
pub const ENV_TRACE: &str = "MESH_CLUSTER_TRACE";

/// Default replication factor for a cluster of `size` nodes.
///
/// Half the cluster size, floored, at least 1 and at most 10. This is policy,
/// not a law of the mesh; override it with [`ClusterConfig::with_k_value`].
pub fn default_k_value(size: usize) -> usize {
    (size / 2).clamp(1, 10)
}

/// Options for a single advertise/withdraw RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOptions {
    /// Time allowed for one attempt.
    ///
    /// Default: 5000ms
    pub timeout: Duration,

    /// Maximum attempts. `1` delivers the call exactly once.
    ///
    /// Default: 1
    pub retry_limit: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            retry_limit: 1,
        }
    }
}

impl CallOptions {
    /// Create call options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt timeout (builder pattern).
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the attempt limit (builder pattern).
    pub const fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }
}

/// A simulated remote that advertises one service to the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Service name the remote advertises.
    pub service_name: String,

    /// Re-registration interval. `Duration::ZERO` registers once.
    ///
    /// Default: zero
    pub register_every: Duration,
}

impl RemoteConfig {
    /// One-shot remote for `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            register_every: Duration::ZERO,
        }
    }

    /// Re-register every `interval` (builder pattern).
    pub fn with_register_every(mut self, interval: Duration) -> Self {
        self.register_every = interval;
        self
    }
}

/// Configuration of a test cluster.
///
/// Missing fields take their defaults when deserialized, so a JSON shape
/// only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of ring nodes created by `bootstrap`.
    ///
    /// Default: 2
    pub size: usize,

    /// Replication factor for exit shards.
    ///
    /// When unset, [`default_k_value`] of the initial size is used.
    ///
    /// Default: None
    pub k_value: Option<usize>,

    /// Passive endpoints that listen but never register.
    ///
    /// Default: 2
    pub dummy_size: usize,

    /// Whether to start a trace-collector remote (`tcollector`).
    ///
    /// Default: false
    pub trace: bool,

    /// Fixed remotes created on every bootstrap.
    ///
    /// Default: `bob` and `steve`, both one-shot
    pub primary_remotes: Vec<RemoteConfig>,

    /// Additional remotes requested by a test.
    ///
    /// Default: empty
    pub named_remotes: Vec<RemoteConfig>,

    /// Options for advertise/withdraw calls made by remotes.
    pub call: CallOptions,

    /// Upper bound on the convergence wait inside `grow`.
    ///
    /// Default: None (callers impose their own test timeout)
    pub convergence_timeout: Option<Duration>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            size: 2,
            k_value: None,
            dummy_size: 2,
            trace: false,
            primary_remotes: vec![RemoteConfig::new("bob"), RemoteConfig::new("steve")],
            named_remotes: Vec::new(),
            call: CallOptions::default(),
            convergence_timeout: None,
        }
    }
}

impl ClusterConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// A ring-only cluster: no dummies and no remotes.
    pub fn ring_only(size: usize) -> Self {
        Self {
            size,
            dummy_size: 0,
            primary_remotes: Vec::new(),
            ..Self::default()
        }
    }

    /// Set the ring size (builder pattern).
    pub const fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Override the replication factor (builder pattern).
    pub const fn with_k_value(mut self, k_value: usize) -> Self {
        self.k_value = Some(k_value);
        self
    }

    /// Set the number of dummy endpoints (builder pattern).
    pub const fn with_dummy_size(mut self, dummy_size: usize) -> Self {
        self.dummy_size = dummy_size;
        self
    }

    /// Enable or disable the trace-collector remote (builder pattern).
    pub const fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Replace the primary remotes (builder pattern).
    pub fn with_primary_remotes(mut self, remotes: impl IntoIterator<Item = RemoteConfig>) -> Self {
        self.primary_remotes = remotes.into_iter().collect();
        self
    }

    /// Add a named remote (builder pattern).
    pub fn with_named_remote(mut self, remote: RemoteConfig) -> Self {
        self.named_remotes.push(remote);
        self
    }

    /// Set advertise call options (builder pattern).
    pub const fn with_call_options(mut self, call: CallOptions) -> Self {
        self.call = call;
        self
    }

    /// Bound the convergence wait inside `grow` (builder pattern).
    pub const fn with_convergence_timeout(mut self, timeout: Duration) -> Self {
        self.convergence_timeout = Some(timeout);
        self
    }

    /// Effective replication factor.
    pub fn effective_k_value(&self) -> usize {
        self.k_value.unwrap_or_else(|| default_k_value(self.size))
    }

    /// Number of auxiliary actors `bootstrap` waits for after growing the ring.
    pub fn auxiliary_count(&self) -> usize {
        self.dummy_size
            + usize::from(self.trace)
            + self.primary_remotes.len()
            + self.named_remotes.len()
    }

    /// Check the configuration for values the cluster cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::Config("cluster size must be at least 1".into()));
        }
        if self.k_value == Some(0) {
            return Err(Error::Config("k_value must be at least 1".into()));
        }
        if self.call.retry_limit == 0 {
            return Err(Error::Config("call retry_limit must be at least 1".into()));
        }

        let mut seen = std::collections::HashSet::new();
        let names = self
            .primary_remotes
            .iter()
            .chain(&self.named_remotes)
            .map(|r| r.service_name.as_str())
            .chain(self.trace.then_some(TRACE_COLLECTOR_SERVICE));
        for name in names {
            if name.is_empty() {
                return Err(Error::Config("remote service name is empty".into()));
            }
            if !seen.insert(name) {
                return Err(Error::Config(format!("duplicate remote service {name}")));
            }
        }
        Ok(())
    }

    /// Apply overrides from a key lookup (size, k-value, trace).
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_SIZE) {
            self.size = parse_override(ENV_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_K_VALUE) {
            self.k_value = Some(parse_override(ENV_K_VALUE, &raw)?);
        }
        if let Some(raw) = lookup(ENV_TRACE) {
            self.trace = matches!(raw.trim(), "1" | "true" | "yes");
        }
        Ok(self)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }
}

fn parse_override(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}={raw:?} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_k_value_policy() {
        assert_eq!(default_k_value(0), 1);
        assert_eq!(default_k_value(1), 1);
        assert_eq!(default_k_value(2), 1);
        assert_eq!(default_k_value(5), 2);
        assert_eq!(default_k_value(20), 10);
        assert_eq!(default_k_value(21), 10);
        assert_eq!(default_k_value(100), 10);
    }

    #[test]
    fn test_effective_k_value() {
        let config = ClusterConfig::new().with_size(5);
        assert_eq!(config.effective_k_value(), 2);
        assert_eq!(config.with_k_value(4).effective_k_value(), 4);
    }

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.size, 2);
        assert_eq!(config.dummy_size, 2);
        assert_eq!(config.call.timeout, Duration::from_millis(5000));
        assert_eq!(config.call.retry_limit, 1);
        let names: Vec<_> = config
            .primary_remotes
            .iter()
            .map(|r| r.service_name.as_str())
            .collect();
        assert_eq!(names, ["bob", "steve"]);
        assert_eq!(config.auxiliary_count(), 4);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ClusterConfig::new().with_size(0).validate().is_err());
        assert!(ClusterConfig::new().with_k_value(0).validate().is_err());
        let dup = ClusterConfig::new().with_named_remote(RemoteConfig::new("bob"));
        assert!(matches!(dup.validate(), Err(Error::Config(_))));
        let trace_dup = ClusterConfig::new()
            .with_trace(true)
            .with_named_remote(RemoteConfig::new(TRACE_COLLECTOR_SERVICE));
        assert!(trace_dup.validate().is_err());
        assert!(ClusterConfig::new().validate().is_ok());
    }

    #[test]
    fn test_apply_overrides() {
        let vars: HashMap<&str, &str> =
            [(ENV_SIZE, "5"), (ENV_K_VALUE, "3"), (ENV_TRACE, "true")].into();
        let config = ClusterConfig::new()
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.size, 5);
        assert_eq!(config.k_value, Some(3));
        assert!(config.trace);
    }

    #[test]
    fn test_apply_overrides_rejects_garbage() {
        let result = ClusterConfig::new().apply_overrides(|k| {
            (k == ENV_SIZE).then(|| "many".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_remote_config_builder() {
        let remote = RemoteConfig::new("steve").with_register_every(Duration::from_millis(100));
        assert_eq!(remote.service_name, "steve");
        assert_eq!(remote.register_every, Duration::from_millis(100));
    }

    #[test]
    fn test_partial_json_shape_keeps_defaults() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"size": 5, "trace": true}"#).unwrap();
        assert_eq!(config.size, 5);
        assert!(config.trace);
        assert_eq!(config.dummy_size, 2);
        assert_eq!(config.primary_remotes.len(), 2);
        assert_eq!(config.call, CallOptions::default());
        assert!(config.validate().is_ok());
    }
}
