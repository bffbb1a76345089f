//! # Background Reclaimer
//!
//! A periodic, load-gated pass over the [`GuardedAllocator`] registry that
//! removes blocks nobody can reach any more.
//!
//! ## Design
//!
//! - One named thread ticks every `interval` and can also be woken early
//!   with [`Reclaimer::request_cleanup`]. Control messages travel over a
//!   `crossbeam-channel`; dropping the sender stops the thread.
//! - A tick does work only while the externally supplied system load is
//!   below `load_threshold`.
//! - Eligible blocks have no outstanding handle, are not protected, and
//!   have been idle for at least `grace_period`. At most `budget_per_cycle`
//!   are removed per tick, doubled while live bytes exceed
//!   `aggressive_threshold`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ReclaimerConfig;
use crate::error::{Result, WardenError};
use crate::memory::{GuardedAllocator, ReclaimOutcome};

/// Control messages for the reclaimer thread.
enum Signal {
    Cleanup,
}

/// Counters describing reclaimer activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Cycles that ran a reclamation pass.
    pub cycles: u64,
    /// Cycles skipped because system load was too high.
    pub skipped_busy: u64,
    /// Blocks removed over the reclaimer's lifetime.
    pub blocks_reclaimed: u64,
    /// Bytes removed over the reclaimer's lifetime.
    pub bytes_reclaimed: u64,
}

struct Shared {
    allocator: Arc<GuardedAllocator>,
    config: ReclaimerConfig,
    /// Current system load estimate, as `f32` bits.
    load: AtomicU32,
    cycles: AtomicU64,
    skipped_busy: AtomicU64,
    blocks_reclaimed: AtomicU64,
    bytes_reclaimed: AtomicU64,
}

impl Shared {
    fn load(&self) -> f32 {
        f32::from_bits(self.load.load(Ordering::Relaxed))
    }

    fn cycle(&self) -> ReclaimOutcome {
        if self.load() >= self.config.load_threshold {
            self.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return ReclaimOutcome::default();
        }

        let mut budget = self.config.budget_per_cycle;
        if self.allocator.live_bytes() > self.config.aggressive_threshold {
            budget = budget.saturating_mul(2);
        }

        let outcome = self.allocator.reclaim(budget, self.config.grace_period);
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.blocks_reclaimed
            .fetch_add(outcome.blocks as u64, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(outcome.bytes as u64, Ordering::Relaxed);
        outcome
    }
}

/// Load-aware background cleanup over a guarded allocator.
pub struct Reclaimer {
    shared: Arc<Shared>,
    control: Mutex<Option<Sender<Signal>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reclaimer {
    /// Create a reclaimer that only runs when [`run_cycle`](Self::run_cycle)
    /// is called.
    pub fn manual(allocator: Arc<GuardedAllocator>, config: ReclaimerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                allocator,
                config,
                load: AtomicU32::new(0f32.to_bits()),
                cycles: AtomicU64::new(0),
                skipped_busy: AtomicU64::new(0),
                blocks_reclaimed: AtomicU64::new(0),
                bytes_reclaimed: AtomicU64::new(0),
            }),
            control: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Create a reclaimer and start its background thread.
    pub fn start(allocator: Arc<GuardedAllocator>, config: ReclaimerConfig) -> Result<Self> {
        let reclaimer = Self::manual(allocator, config);
        let (tx, rx) = unbounded();
        let shared = Arc::clone(&reclaimer.shared);
        let interval = shared.config.interval;

        let handle = thread::Builder::new()
            .name("warden-reclaimer".into())
            .spawn(move || {
                debug!(?interval, "reclaimer started");
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(Signal::Cleanup) | Err(RecvTimeoutError::Timeout) => {
                            shared.cycle();
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("reclaimer stopped");
            })
            .map_err(|e| WardenError::spawn_failed("reclaimer thread", &e))?;

        *reclaimer.control.lock() = Some(tx);
        *reclaimer.thread.lock() = Some(handle);
        Ok(reclaimer)
    }

    /// Whether the background thread is running.
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Update the system load estimate. Values are clamped to `[0, 1]`;
    /// NaN counts as fully loaded.
    pub fn update_system_load(&self, load: f32) {
        let load = if load.is_nan() { 1.0 } else { load.clamp(0.0, 1.0) };
        self.shared.load.store(load.to_bits(), Ordering::Relaxed);
    }

    /// Current system load estimate.
    pub fn system_load(&self) -> f32 {
        self.shared.load()
    }

    /// Wake the background thread for an early cycle.
    ///
    /// Has no effect on a manual or stopped reclaimer.
    pub fn request_cleanup(&self) {
        if let Some(tx) = self.control.lock().as_ref() {
            let _ = tx.send(Signal::Cleanup);
        }
    }

    /// Run one cycle on the calling thread.
    pub fn run_cycle(&self) -> ReclaimOutcome {
        self.shared.cycle()
    }

    /// Activity counters.
    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            cycles: self.shared.cycles.load(Ordering::Relaxed),
            skipped_busy: self.shared.skipped_busy.load(Ordering::Relaxed),
            blocks_reclaimed: self.shared.blocks_reclaimed.load(Ordering::Relaxed),
            bytes_reclaimed: self.shared.bytes_reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Stop and join the background thread. Idempotent.
    pub fn shutdown(&self) {
        // Dropping the sender disconnects the channel and ends the loop.
        drop(self.control.lock().take());
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
            info!("reclaimer shut down");
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reclaimer")
            .field("running", &self.is_running())
            .field("load", &self.system_load())
            .field("stats", &self.stats())
            .finish()
    }
}
