//! Engine lifecycle state machine.
//!
//! ```text
//! uninitialized -> initializing -> creating-context -> loading-module -> ready
//! ready <-> processing <-> degraded
//! error -> degraded | destroying
//! {ready, processing, degraded, error} -> destroying -> destroyed
//! ```
//!
//! Every non-terminal state may move to `error`. Transitions outside the
//! table fail with [`QuellError::InvalidTransition`] and leave the state as is.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QuellError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    #[default]
    Uninitialized,
    Initializing,
    CreatingContext,
    LoadingModule,
    Ready,
    Processing,
    Degraded,
    Error,
    Destroying,
    Destroyed,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::CreatingContext => "creating-context",
            Self::LoadingModule => "loading-module",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Degraded => "degraded",
            Self::Error => "error",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        }
    }

    /// States reachable in one step.
    pub fn successors(self) -> &'static [EngineState] {
        use EngineState::*;
        match self {
            Uninitialized => &[Initializing, Error],
            Initializing => &[CreatingContext, Error],
            CreatingContext => &[LoadingModule, Error],
            LoadingModule => &[Ready, Error],
            Ready => &[Processing, Destroying, Error],
            Processing => &[Ready, Degraded, Destroying, Error],
            Degraded => &[Processing, Destroying, Error],
            Error => &[Degraded, Destroying],
            Destroying => &[Destroyed, Error],
            Destroyed => &[],
        }
    }

    pub fn can_transition_to(self, next: EngineState) -> bool {
        self.successors().contains(&next)
    }

    /// Ready to serve frames (neural or degraded).
    pub fn is_operational(self) -> bool {
        matches!(self, Self::Ready | Self::Processing | Self::Degraded)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Destroyed
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the adjacency check. Not synchronized on its own; the
/// engine keeps it behind a mutex.
#[derive(Debug, Default)]
pub struct StateMachine {
    current: EngineState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> EngineState {
        self.current
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: EngineState) -> Result<EngineState> {
        let from = self.current;
        if !from.can_transition_to(next) {
            return Err(QuellError::InvalidTransition { from, to: next });
        }
        debug!(%from, to = %next, "engine state transition");
        self.current = next;
        Ok(from)
    }

    /// Bypass the adjacency table. Only forced teardown uses this.
    pub fn force(&mut self, next: EngineState) -> EngineState {
        let from = self.current;
        debug!(%from, to = %next, "forced engine state transition");
        self.current = next;
        from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_ready() {
        let mut sm = StateMachine::new();
        for next in [
            EngineState::Initializing,
            EngineState::CreatingContext,
            EngineState::LoadingModule,
            EngineState::Ready,
            EngineState::Processing,
            EngineState::Ready,
            EngineState::Destroying,
            EngineState::Destroyed,
        ] {
            sm.transition(next).unwrap();
        }
        assert!(sm.current().is_terminal());
    }

    #[test]
    fn illegal_transition_leaves_state_unchanged() {
        let mut sm = StateMachine::new();
        let err = sm.transition(EngineState::Processing).unwrap_err();
        assert_eq!(
            err,
            QuellError::InvalidTransition {
                from: EngineState::Uninitialized,
                to: EngineState::Processing
            }
        );
        assert_eq!(sm.current(), EngineState::Uninitialized);
    }

    #[test]
    fn destroyed_is_terminal() {
        let mut sm = StateMachine::new();
        sm.force(EngineState::Destroyed);
        for s in [
            EngineState::Uninitialized,
            EngineState::Ready,
            EngineState::Error,
            EngineState::Destroying,
        ] {
            assert!(sm.transition(s).is_err());
        }
    }

    #[test]
    fn every_non_terminal_state_can_fail() {
        use EngineState::*;
        for s in [
            Uninitialized,
            Initializing,
            CreatingContext,
            LoadingModule,
            Ready,
            Processing,
            Degraded,
            Destroying,
        ] {
            assert!(s.can_transition_to(Error), "{s} -> error");
        }
        assert!(Error.can_transition_to(Degraded));
        assert!(!Error.can_transition_to(Ready));
    }

    #[test]
    fn degraded_round_trips_through_processing() {
        assert!(EngineState::Degraded.can_transition_to(EngineState::Processing));
        assert!(EngineState::Processing.can_transition_to(EngineState::Degraded));
    }

    #[test]
    fn serializes_kebab_case() {
        let json = serde_json::to_value(EngineState::CreatingContext).unwrap();
        assert_eq!(json, "creating-context");
        assert_eq!(EngineState::LoadingModule.to_string(), "loading-module");
    }
}
