//! Turns SIGINT/SIGTERM into structured callbacks.
//!
//! OS signal handlers cannot capture a closure's environment, so the
//! installed callback is stashed in a process-wide slot (the same
//! `lazy_static!` global-registry pattern used for the lock handle registry
//! in `filelock`) and the actual `extern "C"` handler just forwards the raw
//! signal number into it.
//!
//! Grounded on `examples/original_source/deimos/sig.py`.

use std::{convert::TryFrom, sync::Mutex};

use lazy_static::lazy_static;
use log::warn;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// What the installed callback wants to happen next.
pub enum SignalAction {
    /// Terminate the process with this exit code.
    Exit(i32),
    /// Swallow the signal and keep running.
    Resume,
}

type Callback = Box<dyn Fn(i32) -> Option<SignalAction> + Send + Sync + 'static>;

lazy_static! {
    static ref CALLBACK: Mutex<Option<Callback>> = Mutex::new(None);
}

/// Install `callback` as the handler for SIGINT and SIGTERM. A callback
/// returning `None` terminates the process immediately, mirroring the
/// "die unless you explicitly say otherwise" default of the original.
pub fn install<F>(callback: F)
where
    F: Fn(i32) -> Option<SignalAction> + Send + Sync + 'static,
{
    *CALLBACK.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));

    let action = SigAction::new(SigHandler::Handler(dispatch), SaFlags::empty(), SigSet::empty());
    for sig in &[Signal::SIGINT, Signal::SIGTERM] {
        if let Err(e) = unsafe { signal::sigaction(*sig, &action) } {
            warn!("failed installing handler for {:?}: {}", sig, e);
        }
    }
}

extern "C" fn dispatch(signum: i32) {
    let response = {
        let guard = CALLBACK.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(|f| f(signum))
    };
    match response {
        Some(SignalAction::Resume) => {}
        Some(SignalAction::Exit(code)) => std::process::exit(code),
        None => std::process::exit(-signum),
    }
}

/// Reverse-lookup a raw signal number to its name, for logging. Unknown
/// numbers fall back to a numeric label rather than failing.
pub fn name(signum: i32) -> String {
    match Signal::try_from(signum) {
        Ok(sig) => format!("{:?}", sig),
        Err(_) => format!("signal {}", signum),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_known_signals() {
        assert_eq!(name(libc_sigint()), "SIGINT");
        assert_eq!(name(libc_sigterm()), "SIGTERM");
    }

    #[test]
    fn falls_back_for_unknown_numbers() {
        assert_eq!(name(9999), "signal 9999");
    }

    fn libc_sigint() -> i32 {
        Signal::SIGINT as i32
    }

    fn libc_sigterm() -> i32 {
        Signal::SIGTERM as i32
    }
}
