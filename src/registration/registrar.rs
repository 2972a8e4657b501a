use super::{heartbeat, Phase};
use crate::api::ServiceInstance;
use crate::config::RegistrarConfig;
use crate::error::{CallError, RegistrarError};
use crate::registry::{self, Operation, RegistryClient};
use crate::signals::{CallOutcome, LifecycleEvent, LifecycleSignals, RegistrationState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

fn duration_to_u64_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// State shared between the foreground calls and the heartbeat task.
pub(super) struct Shared {
    pub(super) instance: ServiceInstance,
    pub(super) config: RegistrarConfig,
    pub(super) client: Box<dyn RegistryClient>,
    signals: Arc<dyn LifecycleSignals>,
    phase: watch::Sender<Phase>,
}

impl Shared {
    pub(super) fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    pub(super) fn signal_state(&self, state: RegistrationState) {
        self.signals
            .on_state_change(&self.instance.id, &self.instance.service_name, state);
    }

    pub(super) fn signal_event(&self, event: LifecycleEvent) {
        self.signals
            .on_event(&self.instance.id, &self.instance.service_name, event);
    }

    pub(super) fn mark_registered(&self, event: LifecycleEvent) {
        self.set_phase(Phase::Registered);
        self.signal_state(RegistrationState::Registered);
        self.signal_event(event);
    }

    pub(super) fn mark_failed(&self, event: LifecycleEvent) {
        self.set_phase(Phase::RegistrationFailed);
        self.signal_state(RegistrationState::Unregistered);
        self.signal_event(event);
    }

    /// Run one registry call bounded by the call timeout and `ctx`, and report its outcome.
    pub(super) async fn bounded_call<T, F>(
        &self,
        operation: Operation,
        ctx: &CancellationToken,
        call: F,
    ) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, CallError>>,
    {
        let started = Instant::now();
        let timeout = self.config.call_timeout;

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(CallError::Cancelled { operation }),
            res = time::timeout(timeout, call) => {
                res.unwrap_or_else(|_| Err(CallError::TimedOut { operation, timeout }))
            }
        };

        let outcome = match result {
            Ok(_) => CallOutcome::Success,
            Err(_) => CallOutcome::Failure,
        };
        self.signals.on_call_outcome(
            operation,
            self.client.kind(),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Register with exponential backoff between attempts.
    ///
    /// Gives up with [`RegistrarError::RetriesExhausted`] after
    /// `register_attempts()` failures, or with [`RegistrarError::Cancelled`] as
    /// soon as `ctx` is cancelled. No call is issued once cancellation is seen.
    pub(super) async fn register_with_retry(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(), RegistrarError> {
        let instance = &self.instance;
        let attempts = self.config.register_attempts();
        let mut attempt: u32 = 0;

        loop {
            let err = match self
                .bounded_call(Operation::Register, ctx, self.client.register(instance))
                .await
            {
                Ok(()) => {
                    if attempt > 0 {
                        info!(
                            service = %instance.service_name,
                            attempt = attempt + 1,
                            "Registration succeeded after retries"
                        );
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            if ctx.is_cancelled() {
                return Err(self.cancelled());
            }

            if attempt + 1 >= attempts {
                warn!(
                    service = %instance.service_name,
                    instance_id = %instance.id,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %err,
                    "Registration attempt failed, no retries left"
                );
                return Err(RegistrarError::RetriesExhausted {
                    service: instance.service_name.clone(),
                    instance_id: instance.id.clone(),
                    attempts,
                    last_error: err,
                });
            }

            let delay = self.config.backoff_delay(attempt);
            warn!(
                service = %instance.service_name,
                instance_id = %instance.id,
                attempt = attempt + 1,
                max_attempts = attempts,
                delay_ms = duration_to_u64_ms(delay),
                error = %err,
                "Registration attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(self.cancelled()),
                _ = time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn cancelled(&self) -> RegistrarError {
        RegistrarError::Cancelled {
            service: self.instance.service_name.clone(),
        }
    }
}

enum Lifecycle {
    Idle,
    Running {
        stop: CancellationToken,
        task: JoinHandle<()>,
    },
    Terminated,
}

/// Keeps one service instance registered for as long as it runs.
///
/// `start` registers and spawns the heartbeat task; `stop` halts the task,
/// deregisters and closes the registry client.
pub struct Registrar {
    pub(super) shared: Arc<Shared>,
    lifecycle: Lifecycle,
}

impl Registrar {
    /// Validate the configuration and connect the transport it names.
    pub async fn new(
        instance: ServiceInstance,
        config: RegistrarConfig,
        signals: Arc<dyn LifecycleSignals>,
    ) -> Result<Self, RegistrarError> {
        validate(&instance, &config)?;
        let client = registry::connect(&config).await?;
        Ok(Self::assemble(instance, config, client, signals))
    }

    /// Like [`Registrar::new`], with an already built registry client.
    pub fn with_client(
        instance: ServiceInstance,
        config: RegistrarConfig,
        client: Box<dyn RegistryClient>,
        signals: Arc<dyn LifecycleSignals>,
    ) -> Result<Self, RegistrarError> {
        validate(&instance, &config)?;
        Ok(Self::assemble(instance, config, client, signals))
    }

    fn assemble(
        instance: ServiceInstance,
        config: RegistrarConfig,
        client: Box<dyn RegistryClient>,
        signals: Arc<dyn LifecycleSignals>,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Unregistered);
        Self {
            shared: Arc::new(Shared {
                instance,
                config,
                client,
                signals,
                phase,
            }),
            lifecycle: Lifecycle::Idle,
        }
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.shared.instance
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    /// Watch phase transitions as they happen.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.shared.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running { .. })
    }

    /// Register the instance, then start the heartbeat loop.
    ///
    /// Returns once the initial registration has succeeded or given up. The
    /// heartbeat loop is started either way so a later tick can recover.
    /// Cancelling `ctx` ends the loop but does not deregister.
    pub async fn start(&mut self, ctx: &CancellationToken) {
        let shared = Arc::clone(&self.shared);
        let instance = &shared.instance;

        if !matches!(self.lifecycle, Lifecycle::Idle) {
            warn!(service = %instance.service_name, "Registrar already started, ignoring start");
            return;
        }

        info!(
            service = %instance.service_name,
            instance_id = %instance.id,
            "Attempting initial registration"
        );
        shared.set_phase(Phase::Registering);

        match shared.register_with_retry(ctx).await {
            Ok(()) => {
                info!(
                    service = %instance.service_name,
                    instance_id = %instance.id,
                    "Service successfully registered"
                );
                shared.mark_registered(LifecycleEvent::Registered);
            }
            Err(e @ RegistrarError::Cancelled { .. }) => {
                warn!(service = %instance.service_name, error = %e, "Initial registration aborted");
                shared.set_phase(Phase::Unregistered);
                shared.signal_state(RegistrationState::Unregistered);
            }
            Err(e) => {
                error!(
                    service = %instance.service_name,
                    instance_id = %instance.id,
                    error = %e,
                    "Initial registration failed"
                );
                shared.mark_failed(LifecycleEvent::RegistrationFailed);
            }
        }

        let stop = ctx.child_token();
        let task = tokio::spawn(heartbeat::run(
            Arc::clone(&self.shared),
            ctx.clone(),
            stop.clone(),
        ));
        self.lifecycle = Lifecycle::Running { stop, task };
    }

    /// Halt the heartbeat loop, deregister and release the registry client.
    ///
    /// The deregister call is issued only after the heartbeat task has exited.
    /// Its failure is logged and signaled, never returned.
    pub async fn stop(&mut self, ctx: &CancellationToken) {
        let shared = Arc::clone(&self.shared);
        let instance = &shared.instance;

        match std::mem::replace(&mut self.lifecycle, Lifecycle::Terminated) {
            Lifecycle::Terminated => {
                warn!(service = %instance.service_name, "Registrar already stopped, ignoring stop");
                return;
            }
            Lifecycle::Idle => {
                debug!(service = %instance.service_name, "Registrar was never started");
            }
            Lifecycle::Running { stop, task } => {
                stop.cancel();
                if let Err(e) = task.await {
                    error!(service = %instance.service_name, error = %e, "Heartbeat task terminated abnormally");
                }
            }
        }

        info!(
            service = %instance.service_name,
            instance_id = %instance.id,
            "Initiating graceful shutdown"
        );

        match shared
            .bounded_call(Operation::Deregister, ctx, shared.client.deregister(&instance.id))
            .await
        {
            Ok(()) => {
                info!(
                    service = %instance.service_name,
                    instance_id = %instance.id,
                    "Service successfully deregistered"
                );
                shared.signal_event(LifecycleEvent::Deregistered);
            }
            Err(e) => {
                error!(
                    service = %instance.service_name,
                    instance_id = %instance.id,
                    error = %e,
                    "Deregistration failed"
                );
                shared.signal_event(LifecycleEvent::DeregistrationFailed);
            }
        }

        shared.client.close().await;
        shared.set_phase(Phase::Stopped);
        shared.signal_state(RegistrationState::Unregistered);
        shared.signal_event(LifecycleEvent::Stopped);
        info!(service = %instance.service_name, "Registrar stopped");
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        if let Lifecycle::Running { stop, .. } = &self.lifecycle {
            stop.cancel();
        }
    }
}

fn validate(instance: &ServiceInstance, config: &RegistrarConfig) -> Result<(), RegistrarError> {
    if instance.id.trim().is_empty() {
        return Err(RegistrarError::Configuration(
            "service instance id must not be empty".to_string(),
        ));
    }
    if instance.service_name.trim().is_empty() {
        return Err(RegistrarError::Configuration(
            "service name must not be empty".to_string(),
        ));
    }
    config.validate()
}
