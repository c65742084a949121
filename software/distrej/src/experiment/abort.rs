//! Cross-thread request to end a run early.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::daq::{CompletionStatus, DoneCallback};

#[derive(Debug, Default)]
struct AbortState {
    tripped: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Flag set from a driver thread and polled by the loop at each block boundary.
///
/// The first reason given is kept; later trips only confirm the flag.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    state: Arc<AbortState>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the loop stop at the next block boundary
    pub fn trip(&self, reason: &str) {
        if let Ok(mut r) = self.state.reason.lock() {
            if r.is_none() {
                *r = Some(reason.to_owned());
            }
        }
        self.state.tripped.store(true, Ordering::Release);
    }

    pub fn is_tripped(&self) -> bool {
        self.state.tripped.load(Ordering::Acquire)
    }

    /// Reason given by the first trip, if any
    pub fn reason(&self) -> Option<String> {
        self.state.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Completion callback that trips this signal on a failed status.
    ///
    /// Runs on the driver's thread, so it only logs and sets the flag.
    pub fn done_callback(&self, task: &str) -> DoneCallback {
        let signal = self.clone();
        let task = task.to_owned();
        Box::new(move |status| {
            if let CompletionStatus::Failed { code, message } = status {
                let reason = format!("`{task}` stopped with driver error {code}: {message}");
                error!("{reason}");
                signal.trip(&reason);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_kept() {
        let s = AbortSignal::new();
        assert!(!s.is_tripped());
        assert_eq!(s.reason(), None);

        let other = s.clone();
        std::thread::spawn(move || other.trip("first")).join().unwrap();
        s.trip("second");

        assert!(s.is_tripped());
        assert_eq!(s.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_callback_ignores_success() {
        let s = AbortSignal::new();
        let mut cb = s.done_callback("ao");
        cb(CompletionStatus::Success);
        assert!(!s.is_tripped());

        cb(CompletionStatus::Failed {
            code: -200_290,
            message: "underflow".to_owned(),
        });
        assert!(s.is_tripped());
        assert!(s.reason().unwrap().contains("-200290"));
    }
}
