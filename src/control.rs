//! Cooperative pause/stop flags shared between the engine and a UI or
//! signal handler. Checked only at document boundaries, so a stop request
//! never tears a half-processed file.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

const STOP_NONE: u8 = 0;
const STOP_CANCEL: u8 = 1;
const STOP_RESTORE: u8 = 2;

/// Why a batch was asked to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator cancelled; partial results written so far are kept.
    Cancel,
    /// A snapshot restore is waiting; the batch must yield the ledger.
    Restore,
}

#[derive(Debug, Default)]
pub struct Controls {
    paused: AtomicBool,
    stop: AtomicU8,
}

impl Controls {
    pub fn new() -> Self {
        Controls::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self, reason: StopReason) {
        let v = match reason {
            StopReason::Cancel => STOP_CANCEL,
            StopReason::Restore => STOP_RESTORE,
        };
        self.stop.store(v, Ordering::SeqCst);
        // A stopped batch must not sit parked forever.
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> Option<StopReason> {
        match self.stop.load(Ordering::SeqCst) {
            STOP_CANCEL => Some(StopReason::Cancel),
            STOP_RESTORE => Some(StopReason::Restore),
            _ => None,
        }
    }

    /// Reset all flags before a new run.
    pub fn reset(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.stop.store(STOP_NONE, Ordering::SeqCst);
    }

    /// Park while paused; returns the stop reason the moment one arrives.
    pub fn checkpoint(&self) -> Option<StopReason> {
        loop {
            if let Some(reason) = self.stop_requested() {
                return Some(reason);
            }
            if !self.is_paused() {
                return None;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}
