//! OS process probing.

use crate::testing::ProcessProbe;

/// Probes the host process table with a zero-effect signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl SystemProbe {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // pid 0 and values that wrap negative address process groups.
        let Ok(raw_pid) = i32::try_from(pid) else {
            return false;
        };
        if raw_pid == 0 {
            return false;
        }

        match kill(Pid::from_raw(raw_pid), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            // Exists but owned by another user.
            Err(Errno::EPERM) => true,
            Err(e) => {
                tracing::warn!(pid, error = %e, "Unexpected error probing process, assuming alive");
                true
            }
        }
    }
}

#[cfg(not(unix))]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(SystemProbe::new().is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        let probe = SystemProbe::new();
        assert!(!probe.is_alive(0));
        assert!(!probe.is_alive(u32::MAX));
    }

    #[test]
    fn test_exited_child_is_dead() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!SystemProbe::new().is_alive(pid));
    }
}
