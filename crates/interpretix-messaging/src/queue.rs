use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use interpretix_types::events::ReceivedChange;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1000);

/// FIFO of changes waiting to be applied to the store.
#[derive(Debug, Default)]
pub struct EventQueue {
    entries: VecDeque<ReceivedChange>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_queue(&mut self, entry: ReceivedChange) {
        self.entries.push_back(entry);
    }

    pub fn is_queue_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_next_from_queue(&mut self) -> Option<ReceivedChange> {
        self.entries.pop_front()
    }

    /// Drops everything queued. Returns how many entries were discarded.
    pub fn clear_queue(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Shared "someone is working" flag. Only one holder at a time.
#[derive(Debug, Clone, Default)]
pub struct ProcessingFlag(Arc<AtomicBool>);

impl ProcessingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<ProcessingGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ProcessingGuard(&self.0))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the flag when dropped, including when the holding future is
/// cancelled.
#[derive(Debug)]
pub struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct Cooldown {
    window: Duration,
    until: Mutex<Option<Instant>>,
}

impl Default for Cooldown {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            until: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Starts a new window unless one is running.
    pub fn try_begin(&self) -> bool {
        let now = Instant::now();
        let mut until = self.until.lock();
        if let Some(deadline) = *until {
            if now < deadline {
                debug!(
                    "Cooldown active for another {}ms",
                    (deadline - now).as_millis()
                );
                return false;
            }
        }
        *until = Some(now + self.window);
        true
    }

    pub fn remaining(&self) -> Duration {
        match *self.until.lock() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.remaining().is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefetchOutcome<T> {
    Completed(T),
    AlreadyRunning,
    CoolingDown,
}

impl<T> RefetchOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Gate for user-triggered full refetches.
#[derive(Debug, Default)]
pub struct RefetchController {
    in_flight: ProcessingFlag,
    cooldown: Cooldown,
}

impl RefetchController {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            in_flight: ProcessingFlag::new(),
            cooldown: Cooldown::new(cooldown),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.is_set()
    }

    pub fn cooldown(&self) -> &Cooldown {
        &self.cooldown
    }

    pub async fn run<F, Fut, T>(&self, fetch: F) -> RefetchOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(_guard) = self.in_flight.try_acquire() else {
            debug!("Refetch ignored: already in progress");
            return RefetchOutcome::AlreadyRunning;
        };
        if !self.cooldown.try_begin() {
            debug!("Refetch ignored: cooling down");
            return RefetchOutcome::CoolingDown;
        }
        RefetchOutcome::Completed(fetch().await)
    }
}
