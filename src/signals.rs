//! Observability hooks for the registrar.
//!
//! The registrar reports what happens through a [`LifecycleSignals`] sink
//! handed to it at construction. Nothing here installs a recorder or exporter;
//! [`MetricsSignals`] only talks to whatever `metrics` recorder the host set up.

use crate::registry::{Operation, TransportKind};
use tracing::{debug, info, warn};

/// Registration state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Registered,
    Unregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
        }
    }
}

/// Notable steps of the registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Registered,
    RegistrationFailed,
    HeartbeatSucceeded,
    HeartbeatFailed,
    ReRegistered,
    ReRegistrationFailed,
    Deregistered,
    DeregistrationFailed,
    Stopped,
}

pub trait LifecycleSignals: Send + Sync {
    fn on_state_change(&self, instance_id: &str, service_name: &str, state: RegistrationState);

    fn on_call_outcome(
        &self,
        operation: Operation,
        transport: TransportKind,
        outcome: CallOutcome,
        duration_secs: f64,
    );

    fn on_event(&self, _instance_id: &str, _service_name: &str, _event: LifecycleEvent) {}
}

/// Discards every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignals;

impl LifecycleSignals for NoopSignals {
    fn on_state_change(&self, _: &str, _: &str, _: RegistrationState) {}

    fn on_call_outcome(&self, _: Operation, _: TransportKind, _: CallOutcome, _: f64) {}
}

/// Writes signals to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSignals;

impl LifecycleSignals for TracingSignals {
    fn on_state_change(&self, instance_id: &str, service_name: &str, state: RegistrationState) {
        debug!(instance_id, service = service_name, ?state, "Registrar state");
    }

    fn on_call_outcome(
        &self,
        operation: Operation,
        transport: TransportKind,
        outcome: CallOutcome,
        duration_secs: f64,
    ) {
        debug!(
            operation = operation.as_str(),
            protocol = transport.as_str(),
            status = outcome.as_str(),
            duration_secs,
            "Registry call finished"
        );
    }

    fn on_event(&self, instance_id: &str, service_name: &str, event: LifecycleEvent) {
        match event {
            LifecycleEvent::HeartbeatSucceeded => {
                debug!(instance_id, service = service_name, ?event, "Lifecycle event")
            }
            LifecycleEvent::RegistrationFailed
            | LifecycleEvent::HeartbeatFailed
            | LifecycleEvent::ReRegistrationFailed
            | LifecycleEvent::DeregistrationFailed => {
                warn!(instance_id, service = service_name, ?event, "Lifecycle event")
            }
            _ => info!(instance_id, service = service_name, ?event, "Lifecycle event"),
        }
    }
}

#[cfg(feature = "metrics")]
pub use self::metrics_sink::MetricsSignals;

#[cfg(feature = "metrics")]
mod metrics_sink {
    use super::*;
    use metrics::Label;

    const REGISTRY_CALLS_TOTAL: &str = "registrar_registry_calls_total";
    const REGISTRY_CALL_DURATION_SECONDS: &str = "registrar_registry_call_duration_seconds";
    const REGISTRAR_STATE: &str = "registrar_state";
    const LIFECYCLE_EVENTS_TOTAL: &str = "registrar_lifecycle_events_total";

    /// Emits signals through the `metrics` facade.
    ///
    /// `registrar_state` is 1 while registered and 0 otherwise.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct MetricsSignals;

    impl LifecycleSignals for MetricsSignals {
        fn on_state_change(&self, instance_id: &str, service_name: &str, state: RegistrationState) {
            let value = match state {
                RegistrationState::Registered => 1.0,
                RegistrationState::Unregistered => 0.0,
            };
            metrics::gauge!(
                REGISTRAR_STATE,
                "instance_id" => instance_id.to_string(),
                "service_name" => service_name.to_string()
            )
            .set(value);
        }

        fn on_call_outcome(
            &self,
            operation: Operation,
            transport: TransportKind,
            outcome: CallOutcome,
            duration_secs: f64,
        ) {
            let labels = vec![
                Label::new("operation", operation.as_str()),
                Label::new("protocol", transport.as_str()),
                Label::new("status", outcome.as_str()),
            ];
            metrics::counter!(REGISTRY_CALLS_TOTAL, labels.clone()).increment(1);
            metrics::histogram!(REGISTRY_CALL_DURATION_SECONDS, labels).record(duration_secs);
        }

        fn on_event(&self, _instance_id: &str, service_name: &str, event: LifecycleEvent) {
            metrics::counter!(
                LIFECYCLE_EVENTS_TOTAL,
                "service_name" => service_name.to_string(),
                "event" => format!("{:?}", event)
            )
            .increment(1);
        }
    }
}
