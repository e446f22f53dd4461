use std::fs::File;
use std::process::Child;
use std::time::Instant;

/// One replica's position in the state machine (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Initial,
    Starting,
    Running,
    Stopped,
    Exited,
    Failed,
}

impl ReplicaState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaState::Initial => "initial",
            ReplicaState::Starting => "starting",
            ReplicaState::Running => "running",
            ReplicaState::Stopped => "stopped",
            ReplicaState::Exited => "exited",
            ReplicaState::Failed => "failed",
        }
    }

    /// True for states in which the replica may still hold a live pid.
    pub fn is_live(self) -> bool {
        matches!(self, ReplicaState::Starting | ReplicaState::Running)
    }
}

/// One OS child process belonging to a program, plus its runtime metadata
/// (spec.md §3). The live `Child` handle and redirected output files are
/// owned here so they are released exactly when the replica is dropped.
pub struct Replica {
    pub index: u32,
    pub state: ReplicaState,
    pub pid: Option<u32>,
    pub start_time: Option<Instant>,
    pub stop_time: Option<Instant>,
    pub restarts: u32,
    pub exit_code: Option<i32>,
    pub(crate) child: Option<Child>,
    pub(crate) stdout_file: Option<File>,
    pub(crate) stderr_file: Option<File>,
}

impl Replica {
    /// A not-yet-launched placeholder at `index`, carrying forward the
    /// restart counter from whichever prior replica (if any) occupied it.
    pub fn new(index: u32, restarts: u32) -> Self {
        Replica {
            index,
            state: ReplicaState::Initial,
            pid: None,
            start_time: None,
            stop_time: None,
            restarts,
            exit_code: None,
            child: None,
            stdout_file: None,
            stderr_file: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.pid.is_some() && self.state.is_live()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("index", &self.index)
            .field("state", &self.state.as_str())
            .field("pid", &self.pid)
            .field("restarts", &self.restarts)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}
