// SPDX-License-Identifier: Apache-2.0

//! Program configuration: YAML loading, validation, and hot-swap diffing.

mod error;
mod source;
mod spec;

pub use error::ConfigError;
pub use source::{ConfigSource, ProgramSpecSet, YamlFileSource};
pub use spec::{HotSwapDiff, ProgramSpec, RawProgramSpec, RestartPolicy};
