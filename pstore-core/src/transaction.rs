/// Transaction state machine and the function-scoped driver
///
/// ```text
/// Idle --begin--> Active --ok--> Committing --> Committed
///                   |                 |
///                   +--err/panic--> RolledBack <--commit failed
/// ```
///
/// `Committed` and `RolledBack` are terminal. A handle whose machine is not
/// `Active` refuses every operation.

use crate::{Error, Result};
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Active,
    Committing,
    Committed,
    RolledBack,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::Idle => "idle",
            TxState::Active => "active",
            TxState::Committing => "committing",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// Single-owner state machine. `Cell` keeps it `!Sync`, so a transaction
/// handle built on it cannot be shared between threads.
#[derive(Debug)]
pub struct TxStateMachine {
    state: Cell<TxState>,
}

impl Default for TxStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TxStateMachine {
    pub fn new() -> Self {
        Self {
            state: Cell::new(TxState::Idle),
        }
    }

    pub fn state(&self) -> TxState {
        self.state.get()
    }

    fn transition(&self, from: &[TxState], to: TxState) -> Result<()> {
        let current = self.state.get();
        if from.contains(&current) {
            self.state.set(to);
            Ok(())
        } else {
            Err(Error::transaction(format!(
                "invalid transaction transition from {} to {}",
                current, to
            )))
        }
    }

    pub fn begin(&self) -> Result<()> {
        self.transition(&[TxState::Idle], TxState::Active)
    }

    pub fn start_commit(&self) -> Result<()> {
        self.transition(&[TxState::Active], TxState::Committing)
    }

    pub fn finish_commit(&self) -> Result<()> {
        self.transition(&[TxState::Committing], TxState::Committed)
    }

    /// A failed commit also ends in `RolledBack`
    pub fn roll_back(&self) -> Result<()> {
        self.transition(&[TxState::Active, TxState::Committing], TxState::RolledBack)
    }

    /// Guard for every operation issued through a transaction handle
    pub fn ensure_active(&self) -> Result<()> {
        match self.state.get() {
            TxState::Active => Ok(()),
            other => Err(Error::transaction(format!(
                "transaction handle used while {}",
                other
            ))),
        }
    }
}

/// Backend side of an open transaction
pub trait TxScope {
    fn commit(self) -> Result<()>;
    fn rollback(self) -> Result<()>;
}

/// Run `body` inside `scope`.
///
/// `Ok` commits and `Err` rolls back and returns the error. A panic rolls
/// back and is then resumed. The machine must be `Idle` on entry; it is
/// terminal on return.
pub fn run_in_scope<S, T, F>(machine: &TxStateMachine, scope: S, body: F) -> Result<T>
where
    S: TxScope,
    F: FnOnce(&S) -> Result<T>,
{
    machine.begin()?;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&scope)));

    match outcome {
        Ok(Ok(value)) => {
            machine.start_commit()?;
            match scope.commit() {
                Ok(()) => {
                    machine.finish_commit()?;
                    info!("transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    machine.roll_back()?;
                    warn!(error = %e, "transaction commit failed");
                    Err(e)
                }
            }
        }
        Ok(Err(e)) => {
            machine.roll_back()?;
            if let Err(rollback_err) = scope.rollback() {
                warn!(error = %rollback_err, "rollback failed");
            }
            info!(error = %e, "transaction rolled back");
            Err(e)
        }
        Err(payload) => {
            let _ = machine.roll_back();
            if let Err(rollback_err) = scope.rollback() {
                warn!(error = %rollback_err, "rollback after panic failed");
            }
            warn!("transaction rolled back after panic");
            panic::resume_unwind(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        events: std::cell::RefCell<Vec<&'static str>>,
        fail_commit: bool,
    }

    struct Recording(Rc<Log>);

    impl TxScope for Recording {
        fn commit(self) -> Result<()> {
            self.0.events.borrow_mut().push("commit");
            if self.0.fail_commit {
                Err(Error::timeout("database is locked"))
            } else {
                Ok(())
            }
        }

        fn rollback(self) -> Result<()> {
            self.0.events.borrow_mut().push("rollback");
            Ok(())
        }
    }

    #[test]
    fn test_transitions() {
        let machine = TxStateMachine::new();
        assert!(machine.ensure_active().is_err());
        machine.begin().unwrap();
        assert!(machine.begin().is_err());
        machine.start_commit().unwrap();
        machine.finish_commit().unwrap();
        assert!(machine.state().is_terminal());
        assert_eq!(machine.roll_back().unwrap_err().kind(), ErrorKind::Transaction);
        assert_eq!(machine.ensure_active().unwrap_err().kind(), ErrorKind::Transaction);
    }

    #[test]
    fn test_ok_commits() {
        let log = Rc::new(Log::default());
        let machine = TxStateMachine::new();
        let out = run_in_scope(&machine, Recording(log.clone()), |_| Ok(5)).unwrap();
        assert_eq!(out, 5);
        assert_eq!(machine.state(), TxState::Committed);
        assert_eq!(*log.events.borrow(), vec!["commit"]);
    }

    #[test]
    fn test_err_rolls_back() {
        let log = Rc::new(Log::default());
        let machine = TxStateMachine::new();
        let err = run_in_scope(&machine, Recording(log.clone()), |_| -> Result<()> {
            Err(Error::validation("bad"))
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(machine.state(), TxState::RolledBack);
        assert_eq!(*log.events.borrow(), vec!["rollback"]);
    }

    #[test]
    fn test_failed_commit_ends_rolled_back() {
        let log = Rc::new(Log {
            fail_commit: true,
            ..Log::default()
        });
        let machine = TxStateMachine::new();
        let err = run_in_scope(&machine, Recording(log), |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(machine.state(), TxState::RolledBack);
    }

    #[test]
    fn test_panic_rolls_back_and_resumes() {
        let log = Rc::new(Log::default());
        let machine = TxStateMachine::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run_in_scope(&machine, Recording(log.clone()), |_| -> Result<()> { panic!("boom") })
        }));
        assert!(result.is_err());
        assert_eq!(machine.state(), TxState::RolledBack);
        assert_eq!(*log.events.borrow(), vec!["rollback"]);
    }
}
