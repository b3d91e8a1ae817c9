//! Runtime diagnostics for production debugging.
//!
//! Provides a SIGQUIT (`kill -3`) handler that dumps interpreter state to
//! stderr, the same JVM-thread-dump-style hook the teacher wires into its
//! scheduler. Useful for inspecting a stuck or long-running embedder
//! process without attaching a debugger.
//!
//! ## Usage
//!
//! ```bash
//! kill -3 <pid>
//! ```
//!
//! The process dumps diagnostics to stderr and keeps running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// `Thread`s spawned from a `Vm` over its lifetime, including the main
/// thread. Rc-based reclamation gives no cheap way to observe when a
/// `Thread` actually drops, so this is a creation count, not a live gauge.
pub static THREADS_CREATED: AtomicU64 = AtomicU64::new(0);
/// `BUILTIN`/`CALL` dispatches the executor has run, for a cheap
/// throughput signal in the dump.
pub static CALLS_DISPATCHED: AtomicU64 = AtomicU64::new(0);

/// Install the SIGQUIT signal handler. Safe to call multiple times
/// (idempotent); a `State`/`Vm` embedder typically calls this once at
/// startup.
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            unsafe {
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                    dump_diagnostics();
                });
            }
        }

        #[cfg(not(unix))]
        {
            // No signal handling outside Unix; dump_diagnostics() can still
            // be called directly.
        }
    });
}

/// Dump interpreter diagnostics to stderr. Callable directly or via
/// SIGQUIT.
pub fn dump_diagnostics() {
    use std::io::Write;

    let mut out = std::io::stderr().lock();

    let _ = writeln!(out, "\n=== AQL Runtime Diagnostics ===");
    let _ = writeln!(out, "Timestamp: {:?}", std::time::SystemTime::now());

    let _ = writeln!(out, "\n[Threads]");
    let _ = writeln!(out, "  Created: {}", THREADS_CREATED.load(Ordering::Relaxed));

    let _ = writeln!(out, "\n[Executor]");
    let _ = writeln!(out, "  Calls dispatched: {}", CALLS_DISPATCHED.load(Ordering::Relaxed));

    let _ = writeln!(out, "\n[GC]");
    let _ = writeln!(out, "  Allocation debt: {}", aql_core::gc::debt_snapshot());

    let _ = writeln!(out, "\n=== End Diagnostics ===\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_diagnostics_runs() {
        dump_diagnostics();
    }

    #[test]
    fn install_signal_handler_is_idempotent() {
        install_signal_handler();
        install_signal_handler();
        install_signal_handler();
    }
}
