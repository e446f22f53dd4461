// SPDX-License-Identifier: Apache-2.0

//! supervisor binary entrypoint.

mod cli;
mod logging;
mod repl;
mod signals;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use supervisor_config::{ConfigSource, YamlFileSource};
use supervisor_core::{MonitorLoop, Supervisor};

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    logging::init(cli.verbose);

    let source = Arc::new(YamlFileSource::new(cli.config_file.clone()));
    let specs = source
        .load()
        .with_context(|| format!("failed to load {}", cli.config_file.display()))?;
    let supervisor = Arc::new(Mutex::new(Supervisor::from_specs(specs.into_values())));

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    signals::install(Arc::clone(&shutdown), Arc::clone(&reload))
        .context("failed to install signal handlers")?;

    let monitor_supervisor = Arc::clone(&supervisor);
    let monitor_stop = Arc::clone(&shutdown);
    let monitor_reload = Arc::clone(&reload);
    let monitor_source = Arc::clone(&source);
    let monitor_handle = std::thread::spawn(move || {
        let monitor = MonitorLoop::default();
        monitor.run(monitor_supervisor, monitor_stop, monitor_reload, monitor_source.as_ref());
    });

    let control = repl::ControlSurface::new(
        Arc::clone(&supervisor),
        source.as_ref(),
        Arc::clone(&shutdown),
        Arc::clone(&reload),
    );
    control.run();

    shutdown.store(true, Ordering::SeqCst);
    let _ = monitor_handle.join();

    supervisor
        .lock()
        .expect("supervisor mutex poisoned")
        .shutdown();

    tracing::info!("supervisor shut down cleanly");
    Ok(())
}
