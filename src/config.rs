//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::jobs::model::MAX_JOB_DURATION_SECS;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Name this service uses as `source_service` on envelopes.
    pub service_name: String,
    /// HTTP listen address.
    pub bind_addr: String,
    /// Path of the libSQL database file.
    pub db_path: String,
    /// JSON file of agent profiles loaded at startup, keyed by tenant.
    pub agents_file: Option<String>,
    pub worker: WorkerConfig,
    pub notify: NotifyConfig,
    pub cache: CacheConfig,
    pub delegation: DelegationConfig,
    pub circuit: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of jobs executing at once.
    pub max_parallel_jobs: usize,
    /// Capacity of the in-process work queue.
    pub queue_capacity: usize,
    /// Default max duration applied when a submission gives none.
    pub default_max_duration: Option<Duration>,
    /// How long a timed-out handler gets to observe cancellation before it
    /// is aborted.
    pub cancel_grace: Duration,
}

/// Notification channel settings.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Per-subscription buffer; a full buffer disconnects the subscriber.
    pub buffer: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is considered dead.
    pub heartbeat_timeout: Duration,
}

/// TTL tier durations.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub short_ttl: Duration,
    pub standard_ttl: Duration,
    pub extended_ttl: Duration,
    /// How often expired entries are swept from the fast store.
    pub sweep_interval: Duration,
}

/// Delegation and federation tunables.
#[derive(Debug, Clone)]
pub struct DelegationConfig {
    /// A delegate must score strictly above this.
    pub delegation_threshold: f32,
    /// Collections scoring at or above this join a federation.
    pub inclusion_threshold: f32,
    /// Minimum weight of an explicitly selected collection.
    pub explicit_weight_floor: f32,
    /// Federated results kept after weighted sorting.
    pub top_n: usize,
    /// Per-collection query timeout.
    pub collection_timeout: Duration,
    /// Longest allowed agent-to-agent delegation chain.
    pub max_delegation_depth: usize,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Successes in half-open needed to close.
    pub success_threshold: u32,
    /// How long the circuit stays open.
    pub cool_down: Duration,
}

/// Retry policy for transient downstream errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            service_name: "orchestrator".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            db_path: "./data/orchestrator.db".to_string(),
            agents_file: None,
            worker: WorkerConfig::default(),
            notify: NotifyConfig::default(),
            cache: CacheConfig::default(),
            delegation: DelegationConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 10,
            queue_capacity: 1024,
            default_max_duration: Some(Duration::from_secs(600)), // 10 minutes
            cancel_grace: Duration::from_secs(5),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            buffer: 64,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            short_ttl: Duration::from_secs(300),       // 5 minutes
            standard_ttl: Duration::from_secs(3600),   // 1 hour
            extended_ttl: Duration::from_secs(86_400), // 24 hours
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            delegation_threshold: 0.7,
            inclusion_threshold: 0.3,
            explicit_weight_floor: 0.9,
            top_n: 10,
            collection_timeout: Duration::from_secs(5),
            max_delegation_depth: 3,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cool_down: Duration::from_secs(30),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: Duration::from_millis(50),
        }
    }
}

impl OrchestratorConfig {
    /// Build configuration from `ORCH_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let env = Env { lookup: &lookup };

        let default_max_duration = match env.parse::<u64>("ORCH_JOB_MAX_DURATION_SECS")? {
            Some(0) => None,
            Some(secs) if secs > MAX_JOB_DURATION_SECS => {
                return Err(invalid(
                    "ORCH_JOB_MAX_DURATION_SECS",
                    &format!("must be at most {MAX_JOB_DURATION_SECS}"),
                ));
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => d.worker.default_max_duration,
        };

        let config = Self {
            service_name: lookup("ORCH_SERVICE_NAME").unwrap_or(d.service_name),
            bind_addr: lookup("ORCH_BIND_ADDR").unwrap_or(d.bind_addr),
            db_path: lookup("ORCH_DB_PATH").unwrap_or(d.db_path),
            agents_file: lookup("ORCH_AGENTS_FILE").or(d.agents_file),
            worker: WorkerConfig {
                max_parallel_jobs: env
                    .parse("ORCH_MAX_PARALLEL_JOBS")?
                    .unwrap_or(d.worker.max_parallel_jobs),
                queue_capacity: env
                    .parse("ORCH_QUEUE_CAPACITY")?
                    .unwrap_or(d.worker.queue_capacity),
                default_max_duration,
                cancel_grace: env
                    .millis("ORCH_JOB_CANCEL_GRACE_MS")?
                    .unwrap_or(d.worker.cancel_grace),
            },
            notify: NotifyConfig {
                buffer: env.parse("ORCH_NOTIFY_BUFFER")?.unwrap_or(d.notify.buffer),
                heartbeat_interval: env
                    .secs("ORCH_HEARTBEAT_INTERVAL_SECS")?
                    .unwrap_or(d.notify.heartbeat_interval),
                heartbeat_timeout: env
                    .secs("ORCH_HEARTBEAT_TIMEOUT_SECS")?
                    .unwrap_or(d.notify.heartbeat_timeout),
            },
            cache: CacheConfig {
                short_ttl: env.secs("ORCH_TTL_SHORT_SECS")?.unwrap_or(d.cache.short_ttl),
                standard_ttl: env
                    .secs("ORCH_TTL_STANDARD_SECS")?
                    .unwrap_or(d.cache.standard_ttl),
                extended_ttl: env
                    .secs("ORCH_TTL_EXTENDED_SECS")?
                    .unwrap_or(d.cache.extended_ttl),
                sweep_interval: env
                    .secs("ORCH_CACHE_SWEEP_SECS")?
                    .unwrap_or(d.cache.sweep_interval),
            },
            delegation: DelegationConfig {
                delegation_threshold: env
                    .parse("ORCH_DELEGATION_THRESHOLD")?
                    .unwrap_or(d.delegation.delegation_threshold),
                inclusion_threshold: env
                    .parse("ORCH_INCLUSION_THRESHOLD")?
                    .unwrap_or(d.delegation.inclusion_threshold),
                explicit_weight_floor: env
                    .parse("ORCH_EXPLICIT_WEIGHT_FLOOR")?
                    .unwrap_or(d.delegation.explicit_weight_floor),
                top_n: env.parse("ORCH_FEDERATION_TOP_N")?.unwrap_or(d.delegation.top_n),
                collection_timeout: env
                    .millis("ORCH_COLLECTION_TIMEOUT_MS")?
                    .unwrap_or(d.delegation.collection_timeout),
                max_delegation_depth: env
                    .parse("ORCH_MAX_DELEGATION_DEPTH")?
                    .unwrap_or(d.delegation.max_delegation_depth),
            },
            circuit: CircuitBreakerConfig {
                failure_threshold: env
                    .parse("ORCH_CIRCUIT_FAILURE_THRESHOLD")?
                    .unwrap_or(d.circuit.failure_threshold),
                success_threshold: env
                    .parse("ORCH_CIRCUIT_SUCCESS_THRESHOLD")?
                    .unwrap_or(d.circuit.success_threshold),
                cool_down: env
                    .secs("ORCH_CIRCUIT_COOL_DOWN_SECS")?
                    .unwrap_or(d.circuit.cool_down),
            },
            retry: RetryConfig {
                max_attempts: env
                    .parse("ORCH_RETRY_MAX_ATTEMPTS")?
                    .unwrap_or(d.retry.max_attempts),
                initial_backoff: env
                    .millis("ORCH_RETRY_INITIAL_MS")?
                    .unwrap_or(d.retry.initial_backoff),
                max_backoff: env.millis("ORCH_RETRY_MAX_MS")?.unwrap_or(d.retry.max_backoff),
                multiplier: env
                    .parse("ORCH_RETRY_MULTIPLIER")?
                    .unwrap_or(d.retry.multiplier),
                jitter: env.millis("ORCH_RETRY_JITTER_MS")?.unwrap_or(d.retry.jitter),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.max_parallel_jobs == 0 {
            return Err(invalid("ORCH_MAX_PARALLEL_JOBS", "must be at least 1"));
        }
        if self.worker.queue_capacity == 0 {
            return Err(invalid("ORCH_QUEUE_CAPACITY", "must be at least 1"));
        }
        if self.notify.buffer == 0 {
            return Err(invalid("ORCH_NOTIFY_BUFFER", "must be at least 1"));
        }
        if self.notify.heartbeat_timeout <= self.notify.heartbeat_interval {
            return Err(invalid(
                "ORCH_HEARTBEAT_TIMEOUT_SECS",
                "must be longer than the heartbeat interval",
            ));
        }
        for (key, value) in [
            ("ORCH_DELEGATION_THRESHOLD", self.delegation.delegation_threshold),
            ("ORCH_INCLUSION_THRESHOLD", self.delegation.inclusion_threshold),
            ("ORCH_EXPLICIT_WEIGHT_FLOOR", self.delegation.explicit_weight_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, "must be within 0.0..=1.0"));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("ORCH_RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| invalid(key, &format!("{raw:?}: {e}"))),
        }
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}
