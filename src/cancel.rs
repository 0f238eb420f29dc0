//! Cancellation signal
//!
//! A cheap, cloneable flag that callers (a dropped HTTP client, a timeout, a
//! user pressing stop) can trip from any thread. The generation loop polls it
//! at every token boundary, and the native context polls it from inside
//! decode through [`CancelSignal::abort_callback`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::runtime::AbortCallback;

#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing stop flag.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            flag,
            deadline: None,
        }
    }

    /// Also reports cancellation once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Native abort hook: returns true when the signal has fired.
    pub fn abort_callback(&self) -> AbortCallback {
        let signal = self.clone();
        Box::new(move || signal.is_cancelled())
    }
}
