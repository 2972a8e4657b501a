use super::registrar::Shared;
use super::Phase;
use crate::error::RegistrarError;
use crate::registry::Operation;
use crate::signals::LifecycleEvent;
use std::sync::Arc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Heartbeat loop. Exits only when `stop` is cancelled, which also happens
/// when its parent `outer` is cancelled.
pub(super) async fn run(shared: Arc<Shared>, outer: CancellationToken, stop: CancellationToken) {
    let period = shared.config.heartbeat_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => beat(&shared, &stop).await,
        }
    }

    if outer.is_cancelled() {
        info!(
            service = %shared.instance.service_name,
            "Heartbeat loop stopped due to context cancellation"
        );
    } else {
        info!(instance_id = %shared.instance.id, "Heartbeat loop stopped");
    }
}

async fn beat(shared: &Shared, ctx: &CancellationToken) {
    let instance = &shared.instance;

    let result = shared
        .bounded_call(Operation::Heartbeat, ctx, shared.client.send_heartbeat(&instance.id))
        .await;

    let err = match result {
        Ok(()) => {
            debug!(service = %instance.service_name, instance_id = %instance.id, "Heartbeat sent");
            shared.mark_registered(LifecycleEvent::HeartbeatSucceeded);
            return;
        }
        // stopping mid-call is not a registry failure
        Err(_) if ctx.is_cancelled() => return,
        Err(e) => e,
    };

    warn!(
        service = %instance.service_name,
        instance_id = %instance.id,
        error = %err,
        "Heartbeat failed, attempting to re-register"
    );
    shared.signal_event(LifecycleEvent::HeartbeatFailed);
    shared.set_phase(Phase::Registering);

    match shared.register_with_retry(ctx).await {
        Ok(()) => {
            info!(
                service = %instance.service_name,
                instance_id = %instance.id,
                "Service successfully re-registered after heartbeat failure"
            );
            shared.mark_registered(LifecycleEvent::ReRegistered);
        }
        Err(RegistrarError::Cancelled { .. }) => {
            debug!(service = %instance.service_name, "Re-registration aborted by shutdown");
        }
        Err(e) => {
            error!(
                service = %instance.service_name,
                instance_id = %instance.id,
                error = %e,
                "Re-registration after heartbeat failure failed"
            );
            shared.mark_failed(LifecycleEvent::ReRegistrationFailed);
        }
    }
}
