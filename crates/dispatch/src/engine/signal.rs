//! Engine-wide cancellation signal
//!
//! One writer (the engine), many readers. The state only moves forward:
//! `Active -> CancelRequested -> Drained`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Broadcast cancellation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    /// Accepting and executing work
    Active,
    /// Shutdown requested; workers finish what is queued
    CancelRequested,
    /// Every worker has exited and the result stream has ended
    Drained,
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::CancelRequested => write!(f, "cancel_requested"),
            Self::Drained => write!(f, "drained"),
        }
    }
}

pub(crate) struct CancellationSignal {
    state: watch::Sender<SignalState>,
    /// Workers stop taking new work
    pub(crate) halt: CancellationToken,
    /// Shutdown deadline passed; nobody waits to deliver results any more
    pub(crate) expired: CancellationToken,
}

impl CancellationSignal {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(SignalState::Active);
        Self {
            state,
            halt: CancellationToken::new(),
            expired: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> SignalState {
        *self.state.borrow()
    }

    /// Move forward to `next`; returns false if already there or past it
    pub(crate) fn advance(&self, next: SignalState) -> bool {
        self.state.send_if_modified(|current| {
            if *current < next {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SignalState> {
        self.state.subscribe()
    }

    /// Fire both tokens
    pub(crate) fn abort(&self) {
        self.halt.cancel();
        self.expired.cancel();
    }
}

/// Wait until the signal reaches `Drained`
pub(crate) async fn drained(mut rx: watch::Receiver<SignalState>) {
    // The sender lives as long as the engine; an error means it is gone.
    let _ = rx.wait_for(|state| *state == SignalState::Drained).await;
}
