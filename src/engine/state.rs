//! engine lifecycle state and the shutdown predicate
use {
    crate::error::{Result, SaverError},
    std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    tracing::{info, warn},
};

/// engine lifecycle states
///
/// the distinction that matters is `Stopping` versus `Reinitializing`:
/// both leave `Running`, but only the former flips the shutdown predicate.
/// source reconfiguration must never cancel in-flight feed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Stopped,
    Starting,
    Running,
    Stopping,
    Reinitializing,
    /// terminal; entered on process exit from any state
    ShuttingDown,
}

/// the flag I/O workers poll between units of work
///
/// cheap to clone and check; set only while the engine is in `Stopping` or
/// `ShuttingDown`.
#[derive(Clone)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl ShutdownFlag {
    /// make an unset flag
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// raise the flag
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// lower the flag
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// whether workers should abort as quickly as possible
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// holds the engine state and keeps the shutdown flag in sync with it
pub struct StateCell {
    state: Mutex<EngineState>,
    shutdown: ShutdownFlag,
}

impl StateCell {
    /// start out uninitialized
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Uninitialized),
            shutdown: ShutdownFlag::new(),
        }
    }

    /// the current state
    pub fn get(&self) -> EngineState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// a clone of the shutdown flag for handing to workers
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// whether the shutdown predicate is raised
    pub fn shutting_down(&self) -> bool {
        self.shutdown.is_set()
    }

    /// attempt a state transition
    ///
    /// disallowed transitions are refused: the state is untouched, a
    /// warning is logged, and the caller must treat the operation as a
    /// no-op.
    ///
    /// # Errors
    ///
    /// returns an error naming the refused transition
    pub fn transition(&self, to: EngineState) -> Result<()> {
        let mut state = self.state.lock().expect("state lock poisoned");
        let from = *state;

        if !Self::allowed(from, to) {
            warn!("refused state transition {:?} -> {:?}", from, to);
            return Err(SaverError::InvalidTransition(format!("{from:?} -> {to:?}")));
        }

        *state = to;
        drop(state);

        // the predicate is true only in Stopping | ShuttingDown; in
        // particular Reinitializing lowers it so feed work continues
        match to {
            EngineState::Stopping | EngineState::ShuttingDown => self.shutdown.set(),
            _ => self.shutdown.clear(),
        }

        info!("engine state: {:?} -> {:?}", from, to);
        Ok(())
    }

    fn allowed(from: EngineState, to: EngineState) -> bool {
        use EngineState::*;
        if from == ShuttingDown {
            return false;
        }
        if to == ShuttingDown {
            return true;
        }
        matches!(
            (from, to),
            (Uninitialized, Initializing)
                | (Initializing, Stopped)
                | (Initializing, Uninitialized)
                | (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Reinitializing)
                | (Stopping, Stopped)
                | (Reinitializing, Running)
        )
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_lifecycle() {
        let cell = StateCell::new();
        for to in [
            EngineState::Initializing,
            EngineState::Stopped,
            EngineState::Starting,
            EngineState::Running,
            EngineState::Stopping,
            EngineState::Stopped,
        ] {
            cell.transition(to).unwrap();
        }
        assert_eq!(cell.get(), EngineState::Stopped);
    }

    #[test]
    fn test_invalid_transition_is_refused() {
        let cell = StateCell::new();
        assert!(cell.transition(EngineState::Running).is_err());
        assert_eq!(cell.get(), EngineState::Uninitialized, "state untouched");
    }

    #[test]
    fn test_reinitializing_keeps_predicate_down() {
        let cell = StateCell::new();
        cell.transition(EngineState::Initializing).unwrap();
        cell.transition(EngineState::Stopped).unwrap();
        cell.transition(EngineState::Starting).unwrap();
        cell.transition(EngineState::Running).unwrap();

        cell.transition(EngineState::Reinitializing).unwrap();
        assert!(!cell.shutting_down(), "reconfiguration is not a shutdown");

        cell.transition(EngineState::Running).unwrap();
        assert!(!cell.shutting_down());
    }

    #[test]
    fn test_stopping_raises_predicate_and_stopped_lowers_it() {
        let cell = StateCell::new();
        cell.transition(EngineState::Initializing).unwrap();
        cell.transition(EngineState::Stopped).unwrap();
        cell.transition(EngineState::Starting).unwrap();
        cell.transition(EngineState::Running).unwrap();

        cell.transition(EngineState::Stopping).unwrap();
        assert!(cell.shutting_down());

        cell.transition(EngineState::Stopped).unwrap();
        assert!(!cell.shutting_down(), "a stopped engine may be restarted");
    }

    #[test]
    fn test_shutting_down_is_terminal_from_anywhere() {
        let cell = StateCell::new();
        cell.transition(EngineState::ShuttingDown).unwrap();
        assert!(cell.shutting_down());
        assert!(cell.transition(EngineState::Initializing).is_err());
        assert!(cell.transition(EngineState::ShuttingDown).is_err());
    }

    #[test]
    fn test_initialization_failure_returns_to_uninitialized() {
        let cell = StateCell::new();
        cell.transition(EngineState::Initializing).unwrap();
        cell.transition(EngineState::Uninitialized).unwrap();
        assert_eq!(cell.get(), EngineState::Uninitialized);
    }
}
