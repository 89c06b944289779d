//! Pipeline state machine: Idle → Loading → Listening ⇄ Suspended, with Error
//! as a sink that only an explicit start leaves.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle states of the wake pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineState {
    Idle,
    Loading,
    Listening,
    Suspended,
    Error,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "Idle"),
            PipelineState::Loading => write!(f, "Loading"),
            PipelineState::Listening => write!(f, "Listening"),
            PipelineState::Suspended => write!(f, "Suspended"),
            PipelineState::Error => write!(f, "Error"),
        }
    }
}

impl PipelineState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        matches!(
            (self, next),
            (PipelineState::Idle, PipelineState::Loading)
                | (PipelineState::Error, PipelineState::Loading) // explicit retry
                | (PipelineState::Loading, PipelineState::Listening)
                | (PipelineState::Loading, PipelineState::Suspended) // backgrounded while loading
                | (PipelineState::Loading, PipelineState::Error)
                | (PipelineState::Listening, PipelineState::Suspended)
                | (PipelineState::Listening, PipelineState::Error) // retry ceiling
                | (PipelineState::Suspended, PipelineState::Listening)
                // stop() is valid from everywhere
                | (_, PipelineState::Idle)
        )
    }
}

/// Thread-safe state holder with a watch channel for observers.
pub struct StateMachine {
    state: RwLock<PipelineState>,
    state_tx: watch::Sender<PipelineState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Idle);
        Self {
            state: RwLock::new(PipelineState::Idle),
            state_tx,
        }
    }

    /// Current state (non-blocking read).
    pub fn current(&self) -> PipelineState {
        *self.state.read()
    }

    /// Attempt a state transition. Returns Ok(new_state) or Err with reason.
    pub fn transition(&self, next: PipelineState) -> Result<PipelineState, String> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(next) {
            let msg = format!("invalid transition: {} -> {}", current, next);
            warn!("{}", msg);
            return Err(msg);
        }
        *state = next;
        self.state_tx.send_replace(next);
        info!(from = %current, to = %next, "state_transition");
        Ok(next)
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
