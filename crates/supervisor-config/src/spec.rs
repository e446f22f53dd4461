use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Restart policy governing whether a terminated replica is respawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    Never,
    OnFailure,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::OnFailure
    }
}

impl<'de> Deserialize<'de> for RestartPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "always" => Ok(RestartPolicy::Always),
            "never" => Ok(RestartPolicy::Never),
            // `unexpected` is the original config's spelling for on_failure.
            "on_failure" | "unexpected" => Ok(RestartPolicy::OnFailure),
            other => Err(serde::de::Error::custom(format!(
                "unknown restart_policy {other:?}, expected always|never|on_failure"
            ))),
        }
    }
}

fn deserialize_exit_codes<'de, D>(deserializer: D) -> Result<BTreeSet<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(i32),
        Many(Vec<i32>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(code) => Ok(BTreeSet::from([code])),
        OneOrMany::Many(codes) => Ok(codes.into_iter().collect()),
    }
}

fn default_processes() -> u32 {
    1
}

fn default_expected_exit_codes() -> BTreeSet<i32> {
    BTreeSet::from([0])
}

fn default_success_timeout() -> u64 {
    5
}

fn default_max_restarts() -> u32 {
    3
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_umask() -> String {
    "022".to_string()
}

/// The serde-facing shape of one `programs:` entry: every field optional,
/// defaults applied by `ProgramSpec::from_raw`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawProgramSpec {
    #[serde(alias = "cmd")]
    pub command: Option<String>,
    #[serde(default = "default_processes")]
    pub processes: u32,
    #[serde(default)]
    pub start_at_launch: bool,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(
        alias = "exitcodes",
        default = "default_expected_exit_codes",
        deserialize_with = "deserialize_exit_codes"
    )]
    pub expected_exit_codes: BTreeSet<i32>,
    #[serde(default = "default_success_timeout")]
    pub success_timeout: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
    #[serde(default)]
    pub discard_output: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_umask")]
    pub umask: String,
}

/// Immutable, validated configuration for one program (spec.md §3/§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub name: String,
    pub command: String,
    pub processes: u32,
    pub start_at_launch: bool,
    pub restart_policy: RestartPolicy,
    pub expected_exit_codes: BTreeSet<i32>,
    pub success_timeout: u64,
    pub max_restarts: u32,
    /// Always a resolvable signal name (`SIGTERM` on fallback).
    pub stop_signal: String,
    pub stop_timeout: u64,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub discard_output: bool,
    pub env: BTreeMap<String, String>,
    /// Empty means "inherit the supervisor's cwd".
    pub working_dir: PathBuf,
    pub umask: u32,
}

/// Known POSIX signal names, without the `SIG` prefix, that `stop_signal`
/// may resolve to. Anything else falls back to `SIGTERM` (spec.md §4.3).
const KNOWN_SIGNAL_NAMES: &[&str] = &[
    "HUP", "INT", "QUIT", "ILL", "ABRT", "FPE", "KILL", "USR1", "SEGV", "USR2", "PIPE", "ALRM",
    "TERM", "CHLD", "CONT", "STOP", "TSTP", "TTIN", "TTOU",
];

fn resolve_stop_signal(raw: &str) -> String {
    let trimmed = raw.trim();
    let bare = trimmed.strip_prefix("SIG").unwrap_or(trimmed).to_uppercase();
    if KNOWN_SIGNAL_NAMES.contains(&bare.as_str()) {
        format!("SIG{bare}")
    } else {
        "SIGTERM".to_string()
    }
}

fn expand_tilde(path: &std::path::Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

impl ProgramSpec {
    /// Validates and normalises a deserialised config row into an immutable spec.
    pub fn from_raw(name: String, raw: RawProgramSpec) -> Result<ProgramSpec, ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidProgram {
                name,
                reason: "program name must not be empty".to_string(),
            });
        }
        let command = raw.command.ok_or_else(|| ConfigError::InvalidProgram {
            name: name.clone(),
            reason: "missing `command` (or `cmd`)".to_string(),
        })?;
        if command.trim().is_empty() {
            return Err(ConfigError::InvalidProgram {
                name,
                reason: "`command` must not be empty".to_string(),
            });
        }
        if raw.processes == 0 {
            return Err(ConfigError::InvalidProgram {
                name,
                reason: "`processes` must be >= 1".to_string(),
            });
        }
        if raw.discard_output && (raw.stdout.is_some() || raw.stderr.is_some()) {
            return Err(ConfigError::InvalidProgram {
                name,
                reason: "`discard_output` is mutually exclusive with `stdout`/`stderr`".to_string(),
            });
        }
        let umask = u32::from_str_radix(raw.umask.trim(), 8).map_err(|_| ConfigError::InvalidProgram {
            name: name.clone(),
            reason: format!("`umask` {:?} is not a valid octal string", raw.umask),
        })?;
        let working_dir = match raw.working_dir {
            Some(dir) => expand_tilde(&dir),
            None => PathBuf::new(),
        };

        Ok(ProgramSpec {
            name,
            command,
            processes: raw.processes,
            start_at_launch: raw.start_at_launch,
            restart_policy: raw.restart_policy,
            expected_exit_codes: raw.expected_exit_codes,
            success_timeout: raw.success_timeout,
            max_restarts: raw.max_restarts,
            stop_signal: resolve_stop_signal(&raw.stop_signal),
            stop_timeout: raw.stop_timeout,
            stdout: raw.stdout,
            stderr: raw.stderr,
            discard_output: raw.discard_output,
            env: raw.env,
            working_dir,
            umask,
        })
    }

    /// Fields whose change forces recreation of every replica (spec.md §4.4).
    pub fn restart_required_diff(&self, other: &ProgramSpec) -> bool {
        self.command != other.command
            || self.umask != other.umask
            || self.working_dir != other.working_dir
            || self.stdout != other.stdout
            || self.stderr != other.stderr
            || self.env != other.env
    }

    /// Hot-swappable fields that changed between `self` (old) and `other` (new).
    /// `None` in a field means that field is unchanged.
    pub fn hot_swap_changes(&self, other: &ProgramSpec) -> HotSwapDiff {
        HotSwapDiff {
            processes: (self.processes != other.processes).then_some(other.processes),
            start_at_launch: (self.start_at_launch != other.start_at_launch)
                .then_some(other.start_at_launch),
            restart_policy: (self.restart_policy != other.restart_policy)
                .then_some(other.restart_policy),
            expected_exit_codes: (self.expected_exit_codes != other.expected_exit_codes)
                .then(|| other.expected_exit_codes.clone()),
            success_timeout: (self.success_timeout != other.success_timeout)
                .then_some(other.success_timeout),
            max_restarts: (self.max_restarts != other.max_restarts).then_some(other.max_restarts),
            stop_signal: (self.stop_signal != other.stop_signal)
                .then(|| other.stop_signal.clone()),
            stop_timeout: (self.stop_timeout != other.stop_timeout).then_some(other.stop_timeout),
        }
    }

    /// True iff no restart-required field and no hot-swap field differs.
    pub fn is_identical(&self, other: &ProgramSpec) -> bool {
        !self.restart_required_diff(other) && self.hot_swap_changes(other).is_empty()
    }
}

/// Per-field hot-swap deltas between an old and a new `ProgramSpec`.
#[derive(Debug, Default, Clone)]
pub struct HotSwapDiff {
    pub processes: Option<u32>,
    pub start_at_launch: Option<bool>,
    pub restart_policy: Option<RestartPolicy>,
    pub expected_exit_codes: Option<BTreeSet<i32>>,
    pub success_timeout: Option<u64>,
    pub max_restarts: Option<u32>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<u64>,
}

impl HotSwapDiff {
    pub fn is_empty(&self) -> bool {
        self.processes.is_none()
            && self.start_at_launch.is_none()
            && self.restart_policy.is_none()
            && self.expected_exit_codes.is_none()
            && self.success_timeout.is_none()
            && self.max_restarts.is_none()
            && self.stop_signal.is_none()
            && self.stop_timeout.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(command: &str) -> RawProgramSpec {
        RawProgramSpec {
            command: Some(command.to_string()),
            processes: default_processes(),
            start_at_launch: false,
            restart_policy: RestartPolicy::default(),
            expected_exit_codes: default_expected_exit_codes(),
            success_timeout: default_success_timeout(),
            max_restarts: default_max_restarts(),
            stop_signal: default_stop_signal(),
            stop_timeout: default_stop_timeout(),
            stdout: None,
            stderr: None,
            discard_output: false,
            env: BTreeMap::new(),
            working_dir: None,
            umask: default_umask(),
        }
    }

    #[test]
    fn rejects_missing_command() {
        let mut r = raw("/bin/true");
        r.command = None;
        let err = ProgramSpec::from_raw("ok".to_string(), r).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProgram { .. }));
    }

    #[test]
    fn rejects_discard_output_with_stdout() {
        let mut r = raw("/bin/true");
        r.discard_output = true;
        r.stdout = Some(PathBuf::from("/tmp/out.log"));
        let err = ProgramSpec::from_raw("ok".to_string(), r).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProgram { .. }));
    }

    #[test]
    fn unknown_stop_signal_falls_back_to_term() {
        let mut r = raw("/bin/true");
        r.stop_signal = "BOGUS".to_string();
        let spec = ProgramSpec::from_raw("ok".to_string(), r).unwrap();
        assert_eq!(spec.stop_signal, "SIGTERM");
    }

    #[test]
    fn bare_signal_name_resolves() {
        let mut r = raw("/bin/true");
        r.stop_signal = "USR1".to_string();
        let spec = ProgramSpec::from_raw("ok".to_string(), r).unwrap();
        assert_eq!(spec.stop_signal, "SIGUSR1");
    }

    #[test]
    fn octal_umask_parses() {
        let spec = ProgramSpec::from_raw("ok".to_string(), raw("/bin/true")).unwrap();
        assert_eq!(spec.umask, 0o022);
    }

    #[test]
    fn hot_swap_vs_restart_required_classification() {
        let a = ProgramSpec::from_raw("ok".to_string(), raw("/bin/true")).unwrap();
        let mut r = raw("/bin/true");
        r.max_restarts = 9;
        let b = ProgramSpec::from_raw("ok".to_string(), r).unwrap();
        assert!(!a.restart_required_diff(&b));
        assert_eq!(a.hot_swap_changes(&b).max_restarts, Some(9));

        let mut r2 = raw("/bin/false");
        let c = ProgramSpec::from_raw("ok".to_string(), {
            r2.command = Some("/bin/false".to_string());
            r2
        })
        .unwrap();
        assert!(a.restart_required_diff(&c));
    }
}
