//! Signal handling for graceful shutdown.
//!
//! Two-phase Ctrl+C: the first press cancels the shared [`CancellationToken`]
//! so the orchestrator can finish whatever it's already touching instead of
//! tearing a write in half; the second press force-exits with code 130.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Exit codes for CLI commands.
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    /// A batch completed with one or more per-source errors.
    CompletedWithErrors = 1,
    /// User interrupted with Ctrl+C.
    Interrupted = 130,
}

/// Global flag indicating the user requested interruption.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Installs a Ctrl+C handler that cancels `token` on the first press and
/// force-exits on the second.
pub fn setup_signal_handler(token: CancellationToken) {
    if let Err(e) = ctrlc::set_handler(move || {
        if INTERRUPTED.swap(true, Ordering::AcqRel) {
            std::process::exit(ExitCode::Interrupted as i32);
        }
        eprintln!("\nInterrupted. Finishing current work...");
        token.cancel();
    }) {
        tracing::warn!(error = %e, "failed to set Ctrl+C handler");
    }
}

/// Check if the user requested interruption via Ctrl+C.
pub fn check_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Acquire)
}

/// Reset the interrupted flag. Call at the start of each top-level
/// operation so a prior Ctrl+C doesn't poison subsequent runs within the
/// same process (relevant once a `watch`-style long-lived mode exists).
pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_interrupted_clears_flag() {
        INTERRUPTED.store(true, Ordering::Release);
        assert!(check_interrupted());
        reset_interrupted();
        assert!(!check_interrupted());
    }
}
