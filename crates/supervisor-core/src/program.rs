use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use supervisor_config::{HotSwapDiff, ProgramSpec};

use crate::error::SupervisorError;
use crate::replica::{Replica, ReplicaState};

/// Owns all replicas of one program and implements the state machine and
/// operations of spec.md §4.3.
pub struct Program {
    pub spec: ProgramSpec,
    pub replicas: std::collections::BTreeMap<u32, Replica>,
    /// Replica indices that have already logged "max restarts reached",
    /// so the warning is emitted once per exhaustion rather than every tick.
    latched: BTreeSet<u32>,
}

impl Program {
    pub fn new(spec: ProgramSpec) -> Self {
        Program {
            spec,
            replicas: std::collections::BTreeMap::new(),
            latched: BTreeSet::new(),
        }
    }

    /// spec.md §4.3 `start()`.
    pub fn start(&mut self) {
        if !self.spec.start_at_launch {
            return;
        }
        for index in 1..=self.spec.processes {
            self.launch_at(index, 0);
        }
    }

    /// spec.md §4.3 `stop(index, force)`.
    pub fn stop(&mut self, index: Option<u32>, force: bool) {
        let targets: Vec<u32> = match index {
            Some(i) => vec![i],
            None if self.spec.start_at_launch || force => self.replicas.keys().copied().collect(),
            None => Vec::new(),
        };
        for i in targets {
            self.stop_one(i);
        }
    }

    fn stop_one(&mut self, index: u32) {
        let Some(replica) = self.replicas.get_mut(&index) else {
            return;
        };
        if !replica.state.is_live() {
            return; // already stopped: no-op
        }
        let Some(pid) = replica.pid else {
            replica.state = ReplicaState::Stopped;
            return;
        };

        let program_group = Pid::from_raw(-(pid as i32));
        let stop_signal = resolve_signal(&self.spec.stop_signal);
        let _ = signal::kill(program_group, stop_signal);

        let deadline = Instant::now() + std::time::Duration::from_secs(self.spec.stop_timeout);
        let mut exit_status = None;
        while Instant::now() < deadline {
            if let Some(child) = replica.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        exit_status = Some(status);
                        break;
                    }
                    Ok(None) => std::thread::sleep(std::time::Duration::from_millis(50)),
                    Err(_) => break,
                }
            } else {
                break;
            }
        }

        if exit_status.is_none() {
            let err = SupervisorError::StopTimeout {
                program: self.spec.name.clone(),
                index,
            };
            tracing::warn!(error = %err, "force killed after stop_timeout");
            let _ = signal::kill(program_group, Signal::SIGKILL);
            if let Some(child) = replica.child.as_mut() {
                exit_status = child.wait().ok();
            }
        }

        replica.state = ReplicaState::Stopped;
        replica.stop_time = Some(Instant::now());
        replica.exit_code = exit_status.and_then(|s| s.code());
        replica.pid = None;
        replica.child = None;
        replica.stdout_file = None;
        replica.stderr_file = None;
    }

    /// spec.md §4.3 `restart()`: advance the automatic-restart branch once,
    /// acting only on terminated (exited/failed) replicas.
    pub fn restart(&mut self) {
        let terminated: Vec<u32> = self
            .replicas
            .iter()
            .filter(|(_, r)| matches!(r.state, ReplicaState::Exited | ReplicaState::Failed))
            .map(|(i, _)| *i)
            .collect();
        for index in terminated {
            self.maybe_restart(index);
        }
    }

    /// spec.md §4.3 `reboot()`: respawn any replica not currently
    /// starting/running, at the same index, used after a reload races with
    /// a live process exiting mid-diff.
    pub fn reboot(&mut self) {
        for index in 1..=self.spec.processes {
            let needs_relaunch = match self.replicas.get(&index) {
                None => true,
                Some(r) => !matches!(r.state, ReplicaState::Starting | ReplicaState::Running),
            };
            if needs_relaunch {
                let restarts = self.replicas.get(&index).map(|r| r.restarts).unwrap_or(0);
                self.launch_at(index, restarts);
            }
        }
    }

    /// spec.md §4.4 `reconcile(new_spec, hot_fields)`.
    pub fn reconcile(&mut self, new_spec: &ProgramSpec, diff: &HotSwapDiff) {
        let old_processes = self.spec.processes;
        let old_start_at_launch = self.spec.start_at_launch;

        self.spec = new_spec.clone();

        if let Some(new_count) = diff.processes {
            if new_count > old_processes {
                for index in (old_processes + 1)..=new_count {
                    self.launch_at(index, 0);
                }
            } else if new_count < old_processes {
                for index in (new_count + 1)..=old_processes {
                    self.stop_one(index);
                }
            }
        }

        if let Some(enabled) = diff.start_at_launch {
            if enabled && !old_start_at_launch {
                if self.replicas.values().all(|r| !r.is_alive()) {
                    self.start();
                } else {
                    self.reboot();
                }
            } else if !enabled && old_start_at_launch {
                self.stop(None, true);
            }
        }
        // Other hot-swap fields (restart_policy, expected_exit_codes,
        // success_timeout, max_restarts, stop_signal, stop_timeout) need no
        // structural action: `self.spec` already carries the new value and
        // takes effect on the next tick/spawn/stop.
    }

    /// spec.md §4.3 `tick()`, steps 1-4, run once per replica per call.
    pub fn tick(&mut self) {
        let indices: Vec<u32> = self.replicas.keys().copied().collect();
        for index in indices {
            self.tick_one(index);
        }
    }

    fn tick_one(&mut self, index: u32) {
        let success_timeout = self.spec.success_timeout;
        let Some(replica) = self.replicas.get_mut(&index) else {
            return;
        };

        match replica.state {
            ReplicaState::Starting => {
                let exited = replica
                    .child
                    .as_mut()
                    .and_then(|c| c.try_wait().ok().flatten());
                if let Some(status) = exited {
                    replica.state = ReplicaState::Failed;
                    replica.exit_code = status.code();
                    replica.pid = None;
                    replica.child = None;
                } else if replica
                    .start_time
                    .map(|t| t.elapsed().as_secs() >= success_timeout)
                    .unwrap_or(false)
                {
                    replica.state = ReplicaState::Running;
                }
            }
            ReplicaState::Running => {
                let exited = replica
                    .child
                    .as_mut()
                    .and_then(|c| c.try_wait().ok().flatten());
                if let Some(status) = exited {
                    replica.state = ReplicaState::Exited;
                    replica.exit_code = status.code();
                    replica.pid = None;
                    replica.child = None;
                }
            }
            ReplicaState::Exited | ReplicaState::Failed => {
                if self.spec.start_at_launch {
                    self.maybe_restart(index);
                }
            }
            ReplicaState::Initial | ReplicaState::Stopped => {}
        }
    }

    /// Shared by `tick`'s restart branch and the explicit `restart()` verb.
    fn maybe_restart(&mut self, index: u32) {
        let Some(replica) = self.replicas.get(&index) else {
            return;
        };
        let exit_code = replica.exit_code;
        let restarts = replica.restarts;

        let should_restart = match self.spec.restart_policy {
            supervisor_config::RestartPolicy::Always => true,
            supervisor_config::RestartPolicy::Never => false,
            supervisor_config::RestartPolicy::OnFailure => exit_code
                .map(|code| !self.spec.expected_exit_codes.contains(&code))
                .unwrap_or(true),
        };

        if should_restart && restarts < self.spec.max_restarts {
            self.launch_at(index, restarts + 1);
            self.latched.remove(&index);
        } else if should_restart {
            if self.latched.insert(index) {
                tracing::warn!(
                    program = %self.spec.name,
                    index,
                    "max restarts reached"
                );
            }
        }
    }

    /// spec.md §4.3 "launch mechanics", identical for every spawn.
    fn launch_at(&mut self, index: u32, restarts: u32) {
        match self.build_child(index) {
            Ok((child, stdout_file, stderr_file)) => {
                let pid = child.id();
                self.replicas.insert(
                    index,
                    Replica {
                        index,
                        state: ReplicaState::Starting,
                        pid: Some(pid),
                        start_time: Some(Instant::now()),
                        stop_time: None,
                        restarts,
                        exit_code: None,
                        child: Some(child),
                        stdout_file,
                        stderr_file,
                    },
                );
            }
            Err(err) => {
                tracing::error!(program = %self.spec.name, index, error = %err, "spawn failed");
                let mut replica = Replica::new(index, restarts);
                replica.state = ReplicaState::Failed;
                self.replicas.insert(index, replica);
            }
        }
    }

    fn build_child(
        &self,
        index: u32,
    ) -> Result<(std::process::Child, Option<std::fs::File>, Option<std::fs::File>), SupervisorError> {
        let mut argv = self.spec.command.split_whitespace();
        let program = argv.next().ok_or_else(|| SupervisorError::SpawnError {
            program: self.spec.name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;
        let args: Vec<&str> = argv.collect();

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(self.spec.env.iter());
        if !self.spec.working_dir.as_os_str().is_empty() {
            cmd.current_dir(&self.spec.working_dir);
        }

        let (stdout_file, stderr_file) = self.open_output_files(index).map_err(|source| {
            SupervisorError::SpawnError {
                program: self.spec.name.clone(),
                source,
            }
        })?;

        let dup = |f: &std::fs::File| {
            f.try_clone().map_err(|source| SupervisorError::SpawnError {
                program: self.spec.name.clone(),
                source,
            })
        };
        cmd.stdout(match &stdout_file {
            Some(f) => Stdio::from(dup(f)?),
            None => Stdio::null(),
        });
        cmd.stderr(match &stderr_file {
            Some(f) => Stdio::from(dup(f)?),
            None => Stdio::null(),
        });

        let umask = self.spec.umask;
        unsafe {
            cmd.pre_exec(move || {
                nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(umask));
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| SupervisorError::SpawnError {
            program: self.spec.name.clone(),
            source,
        })?;

        Ok((child, stdout_file, stderr_file))
    }

    fn open_output_files(
        &self,
        index: u32,
    ) -> std::io::Result<(Option<std::fs::File>, Option<std::fs::File>)> {
        if self.spec.discard_output {
            return Ok((None, None));
        }
        let stdout = self
            .spec
            .stdout
            .as_deref()
            .map(|p| open_append(&indexed_path(p, index, self.spec.processes)))
            .transpose()?;
        let stderr = self
            .spec
            .stderr
            .as_deref()
            .map(|p| open_append(&indexed_path(p, index, self.spec.processes)))
            .transpose()?;
        Ok((stdout, stderr))
    }
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Inserts the replica index immediately before the extension when a
/// program has more than one replica (`app.log` -> `app1.log`).
fn indexed_path(path: &Path, index: u32, processes: u32) -> PathBuf {
    if processes <= 1 {
        return path.to_path_buf();
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|s| s.to_str());
    let file_name = match ext {
        Some(ext) => format!("{stem}{index}.{ext}"),
        None => format!("{stem}{index}"),
    };
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(file_name),
        _ => PathBuf::from(file_name),
    }
}

fn resolve_signal(name: &str) -> Signal {
    match name {
        "SIGHUP" => Signal::SIGHUP,
        "SIGINT" => Signal::SIGINT,
        "SIGQUIT" => Signal::SIGQUIT,
        "SIGILL" => Signal::SIGILL,
        "SIGABRT" => Signal::SIGABRT,
        "SIGFPE" => Signal::SIGFPE,
        "SIGKILL" => Signal::SIGKILL,
        "SIGUSR1" => Signal::SIGUSR1,
        "SIGSEGV" => Signal::SIGSEGV,
        "SIGUSR2" => Signal::SIGUSR2,
        "SIGPIPE" => Signal::SIGPIPE,
        "SIGALRM" => Signal::SIGALRM,
        "SIGCHLD" => Signal::SIGCHLD,
        "SIGCONT" => Signal::SIGCONT,
        "SIGSTOP" => Signal::SIGSTOP,
        "SIGTSTP" => Signal::SIGTSTP,
        "SIGTTIN" => Signal::SIGTTIN,
        "SIGTTOU" => Signal::SIGTTOU,
        _ => Signal::SIGTERM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use supervisor_config::{RawProgramSpec, RestartPolicy};
    use std::collections::{BTreeMap, BTreeSet};

    fn spec(command: &str) -> ProgramSpec {
        ProgramSpec::from_raw(
            "t".to_string(),
            RawProgramSpec {
                command: Some(command.to_string()),
                processes: 1,
                start_at_launch: true,
                restart_policy: RestartPolicy::OnFailure,
                expected_exit_codes: BTreeSet::from([0]),
                success_timeout: 0,
                max_restarts: 3,
                stop_signal: "SIGTERM".to_string(),
                stop_timeout: 2,
                stdout: None,
                stderr: None,
                discard_output: true,
                env: BTreeMap::new(),
                working_dir: None,
                umask: "022".to_string(),
            },
        )
        .unwrap()
    }

    fn wait_until<F: FnMut() -> bool>(mut pred: F) {
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while Instant::now() < deadline {
            if pred() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn s1_autostart_and_clean_exit() {
        let mut program = Program::new(spec("/bin/true"));
        program.start();
        wait_until(|| {
            program.tick();
            matches!(program.replicas[&1].state, ReplicaState::Exited)
        });
        assert_eq!(program.replicas[&1].exit_code, Some(0));
        assert_eq!(program.replicas[&1].restarts, 0);
    }

    #[test]
    fn s2_restart_ceiling() {
        let mut s = spec("/bin/false");
        s.restart_policy = RestartPolicy::Always;
        s.max_restarts = 2;
        let mut program = Program::new(s);
        program.start();
        wait_until(|| {
            program.tick();
            matches!(program.replicas[&1].state, ReplicaState::Exited) && program.replicas[&1].restarts == 2
        });
        // Give the final spawn a moment to exit too, then tick once more: no further restart.
        wait_until(|| {
            program.tick();
            matches!(program.replicas[&1].state, ReplicaState::Exited)
        });
        assert_eq!(program.replicas[&1].restarts, 2);
        assert!(program.latched.contains(&1));
    }

    #[test]
    fn indexed_path_inserts_before_extension() {
        let p = indexed_path(Path::new("/var/log/app.log"), 1, 2);
        assert_eq!(p, PathBuf::from("/var/log/app1.log"));
    }

    #[test]
    fn indexed_path_untouched_for_single_replica() {
        let p = indexed_path(Path::new("/var/log/app.log"), 1, 1);
        assert_eq!(p, PathBuf::from("/var/log/app.log"));
    }

    #[test]
    fn output_redirected_to_file_in_append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("app.log");

        let mut s = spec("/bin/sh -c 'echo hello'");
        s.discard_output = false;
        s.stdout = Some(out_path.clone());
        let mut program = Program::new(s);
        program.start();

        wait_until(|| {
            program.tick();
            matches!(program.replicas[&1].state, ReplicaState::Exited)
        });

        let contents = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[test]
    fn per_replica_output_files_get_distinct_indexed_names() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("app.log");

        let mut s = spec("/bin/sh -c 'echo hi'");
        s.discard_output = false;
        s.stdout = Some(out_path.clone());
        s.processes = 2;
        let mut program = Program::new(s);
        program.start();

        wait_until(|| {
            program.tick();
            program.replicas.values().all(|r| matches!(r.state, ReplicaState::Exited))
        });

        assert!(dir.path().join("app1.log").exists());
        assert!(dir.path().join("app2.log").exists());
    }
}
