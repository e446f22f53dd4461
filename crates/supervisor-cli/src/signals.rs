use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

/// Global flag set by the SIGHUP handler below; `extern "C"` signal
/// handlers cannot capture state, so the flag lives here and
/// `install` hands back an `Arc` alias for the monitor loop to poll.
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sighup(_: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs the two signal handlers named in spec.md §6: interrupt
/// (graceful shutdown, via `ctrlc`) and hang-up (reload). Handlers only
/// set atomic flags; they never touch `Program`/`Replica` state directly
/// (spec.md §9 signal-handler safety).
pub fn install(shutdown: Arc<AtomicBool>, reload_poller: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("failed to install interrupt handler")?;

    unsafe {
        let action = nix::sys::signal::SigAction::new(
            nix::sys::signal::SigHandler::Handler(handle_sighup),
            nix::sys::signal::SaFlags::empty(),
            nix::sys::signal::SigSet::empty(),
        );
        nix::sys::signal::sigaction(nix::sys::signal::Signal::SIGHUP, &action)
            .context("failed to install hang-up handler")?;
    }

    std::thread::spawn(move || loop {
        if RELOAD_REQUESTED.swap(false, Ordering::SeqCst) {
            reload_poller.store(true, Ordering::SeqCst);
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });

    Ok(())
}
