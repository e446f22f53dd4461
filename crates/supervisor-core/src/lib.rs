// SPDX-License-Identifier: Apache-2.0

//! Program/Replica lifecycle engine, supervisor reload logic, and the
//! fixed-cadence monitor loop.

mod error;
mod monitor;
mod program;
mod replica;
mod supervisor;

pub use error::SupervisorError;
pub use monitor::MonitorLoop;
pub use program::Program;
pub use replica::{Replica, ReplicaState};
pub use supervisor::{ReplicaStatus, Supervisor};
