//! Listening-session cancellation.
//! Each session gets its own `CancellationToken` and a generation number.
//! The token interrupts waits (takes, backoff); the generation lets a worker
//! tell that it was superseded even when a result is already in hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub struct SessionGeneration {
    live: Mutex<CancellationToken>,
    counter: Arc<AtomicU64>,
}

impl SessionGeneration {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(CancellationToken::new()),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Supersede the running session and issue a guard for its successor.
    pub fn cancel_and_advance(&self) -> SessionGuard {
        let mut live = self.live.lock();
        live.cancel();
        *live = CancellationToken::new();
        let generation = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        SessionGuard {
            counter: Arc::clone(&self.counter),
            generation,
            token: live.clone(),
        }
    }

    /// Supersede the running session without starting another.
    /// Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        let live = self.live.lock();
        live.cancel();
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_generation(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for SessionGeneration {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by one listening worker for its whole session.
#[derive(Clone)]
pub struct SessionGuard {
    counter: Arc<AtomicU64>,
    generation: u64,
    token: CancellationToken,
}

impl SessionGuard {
    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Neither cancelled nor superseded.
    pub fn should_continue(&self) -> bool {
        self.is_current() && !self.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
