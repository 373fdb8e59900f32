use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::manager::RealtimeManager;

/// A channel is stalled after this many base reconnect delays of silence.
pub const STALL_FACTOR: u32 = 10;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub base_reconnect_delay: Duration,
    pub check_interval: Duration,
}

impl HealthConfig {
    pub fn stall_threshold(&self) -> Duration {
        self.base_reconnect_delay * STALL_FACTOR
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            base_reconnect_delay: Duration::from_secs(1),
            check_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Stalled,
    Reconnecting,
}

/// Watches one registry key and reconnects it when it goes quiet or its
/// join fails. Stops when dropped.
pub struct HealthMonitor {
    key: String,
    state: watch::Receiver<HealthState>,
    retries: watch::Receiver<u32>,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(manager: RealtimeManager, key: impl Into<String>, config: HealthConfig) -> Self {
        let key = key.into();
        let (state_tx, state) = watch::channel(HealthState::Healthy);
        let (retries_tx, retries) = watch::channel(0u32);
        let task = tokio::spawn(run(manager, key.clone(), config, state_tx, retries_tx));

        Self {
            key,
            state,
            retries,
            task,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> HealthState {
        *self.state.borrow()
    }

    /// Number of stalls detected so far.
    pub fn retry_count(&self) -> u32 {
        *self.retries.borrow()
    }

    pub fn watch_retries(&self) -> watch::Receiver<u32> {
        self.retries.clone()
    }

    pub fn stop(self) {}
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    manager: RealtimeManager,
    key: String,
    config: HealthConfig,
    state: watch::Sender<HealthState>,
    retries: watch::Sender<u32>,
) {
    let threshold = config.stall_threshold();
    let mut tick = tokio::time::interval(config.check_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await;

    let mut recovered_at = Instant::now();

    loop {
        tick.tick().await;

        let (Some(last_event), Some(status)) = (manager.last_event_at(&key), manager.status(&key))
        else {
            debug!("Health check: {} not registered", key);
            continue;
        };

        let now = Instant::now();
        let heard_since_recovery = last_event >= recovered_at;

        if *state.borrow() == HealthState::Reconnecting && heard_since_recovery && !status.is_failure() {
            state.send_replace(HealthState::Healthy);
            info!("Realtime channel {} healthy again", key);
        }

        let silence = now.saturating_duration_since(last_event.max(recovered_at));
        let since_recovery = now.saturating_duration_since(recovered_at);
        let silent = silence >= threshold;
        let failed = status.is_failure() && since_recovery >= config.base_reconnect_delay;
        if !silent && !failed {
            continue;
        }

        state.send_replace(HealthState::Stalled);
        retries.send_modify(|n| *n += 1);
        if failed {
            warn!("Realtime channel {} stalled: status {}", key, status);
        } else {
            warn!(
                "Realtime channel {} stalled: no events for {}ms",
                key,
                silence.as_millis()
            );
        }

        state.send_replace(HealthState::Reconnecting);
        match manager.reconnect(&key) {
            Ok(true) => {}
            Ok(false) => debug!("Realtime channel {} gone before reconnect", key),
            Err(e) => warn!("Realtime channel {} reconnect failed: {}", key, e),
        }
        recovered_at = Instant::now();
    }
}
