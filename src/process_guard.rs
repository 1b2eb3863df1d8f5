//! Process lifecycle management for external utilities
//!
//! Every utility is spawned in its own process group, so a Ctrl+C typed at
//! the terminal is delivered to the installer alone. The installer turns
//! SIGINT, SIGTERM and SIGHUP into an abort request that the workflow
//! honors at the next step boundary.
//!
//! Children are never signalled from here. Interrupting `sgdisk` or
//! `zpool create` halfway leaves partition tables and pool labels in a
//! state nobody can reason about.

use nix::unistd::Pid;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Shared abort request.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag {
    requested: Arc<AtomicBool>,
    signal: Arc<AtomicI32>,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the workflow to stop at the next step boundary.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// True once an abort has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Signal number that triggered the abort, if one did.
    pub fn signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }

    fn request_from_signal(&self, sig: i32) {
        self.signal.store(sig, Ordering::SeqCst);
        self.request();
    }
}

/// Route SIGINT (Ctrl+C), SIGTERM and SIGHUP into `flag`.
///
/// Call this once at program start. The handler thread only sets the flag;
/// running commands are left to finish.
pub fn init_signal_handlers(flag: &AbortFlag) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let flag = flag.clone();

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            if flag.is_requested() {
                tracing::warn!(
                    "Received {} again; still waiting for the current step to finish",
                    signal_name
                );
            } else {
                tracing::warn!(
                    "Received {}, stopping after the current step completes",
                    signal_name
                );
            }
            flag.request_from_signal(sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: setpgid is async-signal-safe and touches no parent state
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::from)?;
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_abort_flag_shared_between_clones() {
        let flag = AbortFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_requested());

        flag.request();
        assert!(clone.is_requested());
        assert_eq!(clone.signal(), None);
    }

    #[test]
    fn test_abort_flag_records_signal() {
        let flag = AbortFlag::new();
        flag.request_from_signal(15);
        assert!(flag.is_requested());
        assert_eq!(flag.signal(), Some(15));
    }

    #[test]
    fn test_child_leads_its_own_process_group() {
        let output = Command::new("sh")
            .args(["-c", "cut -d' ' -f5 /proc/$$/stat"])
            .in_new_process_group()
            .output()
            .expect("spawn sh");
        assert!(output.status.success());

        let child_pgid: i32 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .expect("numeric pgid");
        let our_pgid = nix::unistd::getpgrp().as_raw();
        assert_ne!(child_pgid, our_pgid);
    }
}
