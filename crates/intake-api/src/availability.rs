use std::sync::Arc;
use std::time::{Duration, Instant};

use intake_core::{PrimaryStore, StoreError};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default)]
struct ProbeState {
    available: bool,
    checked_at: Option<Instant>,
}

/// Shared view of whether the primary store is reachable.
///
/// The answer is cached for `probe_interval`. Once it expires the next caller pings the store.
/// Any failed call marks the store down so concurrent requests stop trying it until the next
/// probe.
pub struct PrimaryHandle {
    store: Arc<dyn PrimaryStore>,
    probe_interval: Duration,
    state: Mutex<ProbeState>,
}

impl PrimaryHandle {
    #[must_use]
    pub fn new(store: Arc<dyn PrimaryStore>, probe_interval: Duration) -> Self {
        Self { store, probe_interval, state: Mutex::new(ProbeState::default()) }
    }

    #[must_use]
    pub fn store(&self) -> &dyn PrimaryStore {
        self.store.as_ref()
    }

    /// Cached availability, probing the store when the cached answer is stale.
    #[must_use]
    pub fn is_available(&self) -> bool {
        {
            let state = self.state.lock();
            if let Some(checked_at) = state.checked_at {
                if checked_at.elapsed() < self.probe_interval {
                    return state.available;
                }
            }
        }
        self.refresh()
    }

    /// Pings the store now regardless of the cached answer.
    #[must_use]
    pub fn refresh(&self) -> bool {
        match self.store.ping() {
            Ok(()) => {
                self.mark_available();
                true
            }
            Err(err) => {
                self.mark_unavailable(&err);
                false
            }
        }
    }

    pub fn mark_available(&self) {
        self.record(true, None);
    }

    pub fn mark_unavailable(&self, err: &StoreError) {
        self.record(false, Some(err));
    }

    fn record(&self, available: bool, cause: Option<&StoreError>) {
        let mut state = self.state.lock();
        let changed = state.checked_at.is_none() || state.available != available;
        state.available = available;
        state.checked_at = Some(Instant::now());
        drop(state);

        if !changed {
            return;
        }
        match cause {
            Some(err) => tracing::warn!("primary store marked unavailable: {err}"),
            None => tracing::info!("primary store available"),
        }
    }
}
