use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use colored::Colorize;
use supervisor_config::ConfigSource;
use supervisor_core::Supervisor;

const VERBS: &[&str] = &["status", "start", "stop", "restart", "reload", "help", "quit", "exit"];

const HELP_TEXT: &[(&str, &str)] = &[
    ("status", "Show the status of all managed programs, or one [program] [replica_index]."),
    ("start", "Start a program: start <name>."),
    ("stop", "Stop a program or one of its replicas: stop <name> [index]."),
    ("restart", "Restart a program, or every program if none is named: restart [name]."),
    ("reload", "Reload the configuration file."),
    ("quit/exit", "Exit the control surface."),
    ("help", "Show this help, or help <verb> for one command."),
];

/// Thin verb→`Supervisor`-method adapter (spec.md §4.6), plus the REPL
/// mechanics themselves (prompt, timed input) that spec.md leaves
/// unspecified at §1.
pub struct ControlSurface<'a> {
    supervisor: Arc<Mutex<Supervisor>>,
    source: &'a dyn ConfigSource,
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl<'a> ControlSurface<'a> {
    pub fn new(
        supervisor: Arc<Mutex<Supervisor>>,
        source: &'a dyn ConfigSource,
        shutdown: Arc<AtomicBool>,
        reload: Arc<AtomicBool>,
    ) -> Self {
        ControlSurface {
            supervisor,
            source,
            shutdown,
            reload,
        }
    }

    /// Blocks the calling thread, reading lines from stdin until `quit`,
    /// `exit`, EOF, or the shutdown flag is set by a signal handler.
    ///
    /// Grounded in `original_source/src/Terminal/terminal.py`'s
    /// `select()`-based 1-second timed read: a genuine `select(2)` on
    /// stdin isn't exposed in safe std Rust, so this polls the shutdown
    /// flag on a short interval around a blocking read on its own thread.
    pub fn run(&self) {
        self.print_help();
        let (line_tx, line_rx) = std::sync::mpsc::channel::<String>();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            print!("> ");
            let _ = std::io::stdout().flush();
            match line_rx.recv_timeout(std::time::Duration::from_secs(1)) {
                Ok(line) => self.dispatch(&line),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    fn dispatch(&self, line: &str) {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return;
        };
        let args: Vec<&str> = parts.collect();

        match verb {
            "status" => self.cmd_status(&args),
            "start" => self.cmd_start(&args),
            "stop" => self.cmd_stop(&args),
            "restart" => self.cmd_restart(&args),
            "reload" => self.cmd_reload(),
            "help" => self.cmd_help(&args),
            "quit" | "exit" => self.shutdown.store(true, Ordering::SeqCst),
            other => println!("Unknown command: {other}"),
        }
    }

    fn cmd_status(&self, args: &[&str]) {
        let name = args.first().copied();
        let index: Option<u32> = args.get(1).and_then(|s| s.parse().ok());
        let supervisor = self.supervisor.lock().expect("supervisor mutex poisoned");
        match supervisor.status(name, index) {
            Ok(rows) => {
                for row in rows {
                    let start = row
                        .start_time
                        .map(|t| {
                            DateTime::<Local>::from(t)
                                .format("%Y-%m-%d %H:%M:%S")
                                .to_string()
                        })
                        .unwrap_or_else(|| "N/A".to_string());
                    let exit = row
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "N/A".to_string());
                    let pid = row.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
                    println!(
                        "Program:{} Index:{} PID:{} State:{} Start:{} Exit:{} Restarts:{}",
                        row.program, row.index, pid, row.state, start, exit, row.restarts
                    );
                }
            }
            Err(err) => println!("{}", err.to_string().red()),
        }
    }

    fn cmd_start(&self, args: &[&str]) {
        let Some(name) = args.first() else {
            println!("{}", "usage: start <name>".yellow());
            return;
        };
        let mut supervisor = self.supervisor.lock().expect("supervisor mutex poisoned");
        if let Err(err) = supervisor.start(name) {
            println!("{}", err.to_string().red());
        }
    }

    fn cmd_stop(&self, args: &[&str]) {
        let Some(name) = args.first() else {
            println!("{}", "usage: stop <name> [index]".yellow());
            return;
        };
        let index: Option<u32> = args.get(1).and_then(|s| s.parse().ok());
        let mut supervisor = self.supervisor.lock().expect("supervisor mutex poisoned");
        if let Err(err) = supervisor.stop(name, index) {
            println!("{}", err.to_string().red());
        }
    }

    fn cmd_restart(&self, args: &[&str]) {
        let name = args.first().copied();
        let mut supervisor = self.supervisor.lock().expect("supervisor mutex poisoned");
        if let Err(err) = supervisor.restart(name) {
            println!("{}", err.to_string().red());
        }
    }

    fn cmd_reload(&self) {
        let mut supervisor = self.supervisor.lock().expect("supervisor mutex poisoned");
        if let Err(err) = supervisor.reload(self.source) {
            println!("{}", err.to_string().red());
        }
        self.reload.store(false, Ordering::SeqCst);
    }

    fn cmd_help(&self, args: &[&str]) {
        match args.first() {
            None => println!("Available commands: {}", VERBS.join(", ")),
            Some(verb) => match HELP_TEXT.iter().find(|(name, _)| *name == *verb) {
                Some((_, text)) => println!("{verb}: {text}"),
                None => println!("No help available for {verb:?}"),
            },
        }
    }

    fn print_help(&self) {
        self.cmd_help(&[]);
    }
}
