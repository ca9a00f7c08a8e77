//! Signal trap for graceful shutdown
//!
//! SIGINT and SIGTERM trigger the cleanup exactly once; repeating the
//! signal three times abandons cleanup and exits immediately. SIGQUIT is
//! swallowed in normal operation, but left at its default (immediate exit)
//! when `DEBUG` is set so a wedged daemon can be inspected.

use std::process::exit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::info;
use nix::sys::signal::{SigSet, Signal};

use crate::errors::{DaemonError, Result};

/// Signals the trap handles, depending on debug mode.
fn handled_signals(debug: bool) -> Vec<Signal> {
    let mut signals = vec![Signal::SIGINT, Signal::SIGTERM];
    if !debug {
        signals.push(Signal::SIGQUIT);
    }
    signals
}

/// Install the trap. Must run before other threads are spawned so the
/// signal mask is inherited everywhere.
pub fn trap(cleanup: impl FnOnce() + Send + 'static) -> Result<()> {
    let debug = std::env::var("DEBUG").is_ok();
    let mut set = SigSet::empty();
    for sig in handled_signals(debug) {
        set.add(sig);
    }
    set.thread_block()
        .map_err(|e| DaemonError::Kernel(format!("failed to block signals: {}", e)))?;

    let cleanup = Arc::new(Mutex::new(Some(cleanup)));
    let interrupt_count = Arc::new(AtomicU32::new(0));

    std::thread::spawn(move || {
        loop {
            let sig = match set.wait() {
                Ok(sig) => sig,
                Err(_) => continue,
            };
            match sig {
                Signal::SIGINT | Signal::SIGTERM => {
                    let count = interrupt_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if count == 1 {
                        info!("received signal {}, starting shutdown", sig);
                        let cleanup = Arc::clone(&cleanup);
                        std::thread::spawn(move || {
                            if let Some(f) =
                                cleanup.lock().unwrap_or_else(|p| p.into_inner()).take()
                            {
                                f();
                            }
                            exit(0);
                        });
                    } else if count >= 3 {
                        info!("forcing shutdown, interrupting cleanup");
                        exit(128 + sig as i32);
                    } else {
                        info!("shutdown already in progress ({}/3)", count);
                    }
                }
                Signal::SIGQUIT => {
                    exit(128 + Signal::SIGQUIT as i32);
                }
                _ => {}
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handled_signals_normal() {
        let signals = handled_signals(false);
        assert!(signals.contains(&Signal::SIGINT));
        assert!(signals.contains(&Signal::SIGTERM));
        assert!(signals.contains(&Signal::SIGQUIT));
    }

    #[test]
    fn test_handled_signals_debug_leaves_sigquit() {
        let signals = handled_signals(true);
        assert!(!signals.contains(&Signal::SIGQUIT));
        assert_eq!(signals.len(), 2);
    }
}
