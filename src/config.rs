use crate::error::RegistrarError;
use crate::registry::TransportKind;
use std::time::Duration;

/// Exponent cap for the retry backoff, keeps `base * 2^attempt` from overflowing.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Settings for a [`Registrar`](crate::registration::Registrar).
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Base URL (http), URI (grpc) or comma separated endpoints (etcd).
    pub registry_address: String,
    pub transport: TransportKind,
    pub heartbeat_interval: Duration,
    /// Upper bound for every single registry call.
    pub call_timeout: Duration,
    /// Number of registration attempts; `0` still makes one attempt.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            registry_address: String::new(),
            transport: TransportKind::Http,
            heartbeat_interval: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            max_retries: 5,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl RegistrarConfig {
    pub fn new(registry_address: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            registry_address: registry_address.into(),
            transport,
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), RegistrarError> {
        if self.registry_address.trim().is_empty() {
            return Err(RegistrarError::Configuration(
                "registry address must be provided".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(RegistrarError::Configuration(
                "heartbeat interval must be a positive duration".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(RegistrarError::Configuration(
                "call timeout must be a positive duration".to_string(),
            ));
        }
        Ok(())
    }

    /// Total register calls one run of the retry protocol may make.
    pub fn register_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Wait before the attempt following `attempt` (zero based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.retry_base_delay.saturating_mul(factor)
    }
}
