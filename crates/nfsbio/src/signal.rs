//! Delivery of `SIGXFSZ` to callers that write past their file size limit.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Receives process signals raised by the I/O layer.
pub trait SignalSink: Send + Sync {
    /// Delivers `signal` to `pid`, or to the current process when `pid` is `None`.
    fn deliver(&self, pid: Option<i32>, signal: Signal);
}

/// Sends real signals with `kill(2)`.
///
/// A caller without a pid gets no signal: raising `SIGXFSZ` on ourselves
/// would terminate the process hosting the client.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSignals;

impl SignalSink for ProcessSignals {
    fn deliver(&self, pid: Option<i32>, signal: Signal) {
        let Some(pid) = pid else {
            debug!(?signal, "No caller pid, signal dropped");
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), signal) {
            warn!(pid, ?signal, error = %e, "Failed to signal caller");
        }
    }
}
