use indexmap::IndexMap;

use supervisor_config::{ConfigSource, ProgramSpec};

use crate::error::SupervisorError;
use crate::program::Program;
use crate::replica::Replica;

/// Owns every program and drives reload/diff (spec.md §3/§4.4).
///
/// `programs` is insertion-ordered, not sorted: spec.md §3 requires
/// iteration in "latest insertion/diff order" and §5 requires shutdown to
/// stop programs "in registry order", so a `BTreeMap`'s alphabetical
/// iteration is the wrong tool here.
pub struct Supervisor {
    programs: IndexMap<String, Program>,
}

/// One line of `status` output, matching spec.md §6's literal format.
pub struct ReplicaStatus {
    pub program: String,
    pub index: u32,
    pub pid: Option<u32>,
    pub state: &'static str,
    pub start_time: Option<std::time::SystemTime>,
    pub exit_code: Option<i32>,
    pub restarts: u32,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            programs: IndexMap::new(),
        }
    }

    pub fn from_specs(specs: impl IntoIterator<Item = ProgramSpec>) -> Self {
        let mut supervisor = Supervisor::new();
        for spec in specs {
            let name = spec.name.clone();
            let mut program = Program::new(spec);
            program.start();
            supervisor.programs.insert(name, program);
        }
        supervisor
    }

    pub fn program(&self, name: &str) -> Option<&Program> {
        self.programs.get(name)
    }

    pub fn program_names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    /// Advances every program's state machine once (spec.md §4.5). A panic
    /// inside one program's tick is caught and logged as a `TickError`
    /// rather than aborting the loop (spec.md §7).
    pub fn tick_all(&mut self) {
        for (name, program) in self.programs.iter_mut() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| program.tick()));
            if let Err(panic) = result {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let err = SupervisorError::TickError {
                    program: name.clone(),
                    reason,
                };
                tracing::error!(error = %err, "tick failed, continuing with next program");
            }
        }
    }

    /// Same live-replica guard as `reconcile`'s start_at_launch-toggled-on
    /// branch: never calls `Program::start` while any replica is still
    /// alive, since `launch_at` would overwrite it and leak the old child.
    pub fn start(&mut self, name: &str) -> Result<(), SupervisorError> {
        let program = self
            .programs
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        if program.replicas.values().all(|r| !r.is_alive()) {
            program.start();
        } else {
            program.reboot();
        }
        Ok(())
    }

    pub fn stop(&mut self, name: &str, index: Option<u32>) -> Result<(), SupervisorError> {
        let program = self
            .programs
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        if let Some(i) = index {
            if !program.replicas.contains_key(&i) {
                return Err(SupervisorError::ReplicaNotFound {
                    program: name.to_string(),
                    index: i,
                });
            }
        }
        program.stop(index, index.is_none());
        Ok(())
    }

    pub fn restart(&mut self, name: Option<&str>) -> Result<(), SupervisorError> {
        match name {
            Some(name) => {
                let program = self
                    .programs
                    .get_mut(name)
                    .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
                program.restart();
            }
            None => {
                for program in self.programs.values_mut() {
                    program.restart();
                }
            }
        }
        Ok(())
    }

    /// Stops every program, sent in registry order, each bounded by its own
    /// `stop_timeout` (spec.md §5 shutdown cancellation).
    pub fn shutdown(&mut self) {
        for program in self.programs.values_mut() {
            program.stop(None, true);
        }
    }

    pub fn status(&self, name: Option<&str>, index: Option<u32>) -> Result<Vec<ReplicaStatus>, SupervisorError> {
        let mut rows = Vec::new();
        let names: Vec<&str> = match name {
            Some(n) => {
                if !self.programs.contains_key(n) {
                    return Err(SupervisorError::NotFound(n.to_string()));
                }
                vec![n]
            }
            None => self.programs.keys().map(String::as_str).collect(),
        };
        for program_name in names {
            let program = &self.programs[program_name];
            let replicas: Vec<&Replica> = match index {
                Some(i) => program.replicas.get(&i).into_iter().collect(),
                None => program.replicas.values().collect(),
            };
            for replica in replicas {
                rows.push(ReplicaStatus {
                    program: program_name.to_string(),
                    index: replica.index,
                    pid: replica.pid,
                    state: replica.state.as_str(),
                    start_time: replica.start_time.map(instant_to_system_time),
                    exit_code: replica.exit_code,
                    restarts: replica.restarts,
                });
            }
        }
        Ok(rows)
    }

    /// spec.md §4.4 reload algorithm, steps 1-5.
    pub fn reload(&mut self, source: &dyn ConfigSource) -> Result<(), SupervisorError> {
        let new_specs = source.load()?;

        if new_specs.is_empty() {
            self.shutdown();
            self.programs.clear();
            return Ok(());
        }

        for (name, new_spec) in new_specs.iter() {
            match self.programs.get_mut(name) {
                None => {
                    let mut program = Program::new(new_spec.clone());
                    program.start();
                    self.programs.insert(name.clone(), program);
                }
                Some(program) => {
                    if program.spec.restart_required_diff(new_spec) {
                        program.stop(None, true);
                        let mut fresh = Program::new(new_spec.clone());
                        fresh.start();
                        self.programs.insert(name.clone(), fresh);
                    } else {
                        let diff = program.spec.hot_swap_changes(new_spec);
                        if !diff.is_empty() {
                            program.reconcile(new_spec, &diff);
                        }
                    }
                }
            }
        }

        let stale: Vec<String> = self
            .programs
            .keys()
            .filter(|name| !new_specs.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(mut program) = self.programs.shift_remove(&name) {
                program.stop(None, true);
            }
        }

        for program in self.programs.values_mut() {
            if program.spec.start_at_launch {
                program.reboot();
            }
        }

        Ok(())
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Supervisor::new()
    }
}

fn instant_to_system_time(instant: std::time::Instant) -> std::time::SystemTime {
    let now_instant = std::time::Instant::now();
    let now_system = std::time::SystemTime::now();
    if instant <= now_instant {
        now_system - (now_instant - instant)
    } else {
        now_system + (instant - now_instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;
    use supervisor_config::{ConfigError, ProgramSpecSet, RawProgramSpec, RestartPolicy};

    struct FakeSource(StdMutex<ProgramSpecSet>);

    impl FakeSource {
        fn new(specs: ProgramSpecSet) -> Self {
            FakeSource(StdMutex::new(specs))
        }
    }

    impl ConfigSource for FakeSource {
        fn load(&self) -> Result<ProgramSpecSet, ConfigError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn spec(name: &str, command: &str, processes: u32) -> ProgramSpec {
        ProgramSpec::from_raw(
            name.to_string(),
            RawProgramSpec {
                command: Some(command.to_string()),
                processes,
                start_at_launch: true,
                restart_policy: RestartPolicy::OnFailure,
                expected_exit_codes: BTreeSet::from([0]),
                success_timeout: 10,
                max_restarts: 3,
                stop_signal: "SIGTERM".to_string(),
                stop_timeout: 1,
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
    fn s3_graceful_stop_with_escalation() {
        let s = spec("stubborn", "/bin/sh -c 'trap \"\" TERM; sleep 30'", 1);
        let mut supervisor = Supervisor::from_specs(vec![s]);
        wait_until(|| {
            supervisor.status(Some("stubborn"), None).unwrap()[0].pid.is_some()
        });

        supervisor.stop("stubborn", None).unwrap();

        let rows = supervisor.status(Some("stubborn"), None).unwrap();
        assert_eq!(rows[0].state, "stopped");
        assert!(rows[0].pid.is_none());
    }

    #[test]
    fn s4_hot_swap_processes_up() {
        let s = spec("web", "/bin/sleep 5", 2);
        let mut supervisor = Supervisor::from_specs(vec![s.clone()]);
        wait_until(|| supervisor.status(Some("web"), None).unwrap().len() == 2);
        let before: Vec<Option<u32>> = supervisor
            .status(Some("web"), None)
            .unwrap()
            .into_iter()
            .map(|r| r.pid)
            .collect();

        let mut grown = s.clone();
        grown.processes = 4;
        let source = FakeSource::new(ProgramSpecSet::from([("web".to_string(), grown)]));
        supervisor.reload(&source).unwrap();

        let rows = supervisor.status(Some("web"), None).unwrap();
        assert_eq!(rows.len(), 4);
        let after: Vec<Option<u32>> = rows.iter().take(2).map(|r| r.pid).collect();
        assert_eq!(before, after, "old replicas' pids must survive a processes-up hot swap");
    }

    #[test]
    fn s5_restart_required_change_recreates_pids() {
        let s = spec("svc", "/bin/sleep 5", 1);
        let mut supervisor = Supervisor::from_specs(vec![s.clone()]);
        wait_until(|| supervisor.status(Some("svc"), None).unwrap()[0].pid.is_some());
        let old_pid = supervisor.status(Some("svc"), None).unwrap()[0].pid;

        let mut changed = s.clone();
        changed.command = "/bin/sleep 6".to_string();
        let source = FakeSource::new(ProgramSpecSet::from([("svc".to_string(), changed)]));
        supervisor.reload(&source).unwrap();

        wait_until(|| supervisor.status(Some("svc"), None).unwrap()[0].pid.is_some());
        let new_pid = supervisor.status(Some("svc"), None).unwrap()[0].pid;
        assert_ne!(old_pid, new_pid, "restart-required change must recreate the pid");
    }

    #[test]
    fn s6_success_gate_resolves_to_failed() {
        let mut s = spec("quick", "/bin/sh -c 'exit 0'", 1);
        s.success_timeout = 10;
        let mut supervisor = Supervisor::from_specs(vec![s]);
        wait_until(|| {
            supervisor.tick_all();
            supervisor.status(Some("quick"), None).unwrap()[0].state == "failed"
        });
    }

    #[test]
    fn reload_with_empty_spec_set_stops_everything() {
        let s = spec("web", "/bin/sleep 5", 1);
        let mut supervisor = Supervisor::from_specs(vec![s]);
        wait_until(|| supervisor.status(Some("web"), None).unwrap()[0].pid.is_some());

        let source = FakeSource::new(ProgramSpecSet::new());
        supervisor.reload(&source).unwrap();
        assert_eq!(supervisor.program_names().count(), 0);
    }

    #[test]
    fn status_of_unknown_program_is_not_found() {
        let supervisor = Supervisor::new();
        let err = supervisor.status(Some("ghost"), None).unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
    }

    #[test]
    fn start_on_an_already_running_program_does_not_replace_its_pid() {
        let s = spec("web", "/bin/sleep 5", 1);
        let mut supervisor = Supervisor::from_specs(vec![s]);
        wait_until(|| supervisor.status(Some("web"), None).unwrap()[0].pid.is_some());
        let before = supervisor.status(Some("web"), None).unwrap()[0].pid;

        supervisor.start("web").unwrap();

        let after = supervisor.status(Some("web"), None).unwrap()[0].pid;
        assert_eq!(before, after, "start on a live program must not leak the old child");
    }

    #[test]
    fn stop_with_unknown_index_is_replica_not_found() {
        let s = spec("web", "/bin/sleep 5", 1);
        let mut supervisor = Supervisor::from_specs(vec![s]);
        wait_until(|| supervisor.status(Some("web"), None).unwrap()[0].pid.is_some());

        let err = supervisor.stop("web", Some(9)).unwrap_err();
        assert!(matches!(err, SupervisorError::ReplicaNotFound { .. }));
    }

    #[test]
    fn program_iteration_follows_insertion_order_not_alphabetical() {
        let specs = vec![
            spec("zebra", "/bin/true", 1),
            spec("apple", "/bin/true", 1),
            spec("mango", "/bin/true", 1),
        ];
        let supervisor = Supervisor::from_specs(specs);
        let names: Vec<&str> = supervisor.program_names().collect();
        assert_eq!(names, vec!["zebra", "apple", "mango"]);
    }
}
