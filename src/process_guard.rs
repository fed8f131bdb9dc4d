//! Process lifecycle management for storage tool children
//!
//! The engine runs one storage tool at a time. If the provisioner dies while
//! `sgdisk` or `mkfs` is running, that child must not keep writing to the disk
//! on its own. Every tool is spawned in its own process group with a
//! parent-death signal and occupies the global `ToolSlot` until it exits, so a
//! signal handler or the `ProcessGuard` drop can stop it.
//!
//! Interruption is not made safe by this module. A run stopped between the
//! wipe and the final mount leaves the device partially provisioned; the
//! signal handler reports the stage that was in progress so an operator knows
//! where to start manual recovery.

use crate::provision_state::ProvisionStage;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static TOOL_SLOT: OnceLock<Mutex<ToolSlot>> = OnceLock::new();

/// Stage the engine is working towards (`ProvisionStage::order`), `Unwiped` when idle
static ACTIVE_STAGE: AtomicU8 = AtomicU8::new(ProvisionStage::Unwiped as u8);

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunningTool {
    pid: u32,
    program: String,
}

/// The storage tool currently running, if any.
#[derive(Debug, Default)]
pub struct ToolSlot {
    running: Option<RunningTool>,
    /// Set once the process is shutting down; no new tool may start
    closed: bool,
}

impl ToolSlot {
    pub fn global() -> &'static Mutex<ToolSlot> {
        TOOL_SLOT.get_or_init(|| Mutex::new(ToolSlot::default()))
    }

    /// Record `pid` as the running tool.
    pub fn occupy(&mut self, pid: u32, program: &str) {
        if let Some(previous) = self.running.replace(RunningTool {
            pid,
            program: program.to_string(),
        }) {
            warn!(
                "{} (PID {}) still registered when {} started",
                previous.program, previous.pid, program
            );
        }
        debug!("{} running as PID {}", program, pid);
    }

    /// Forget `pid` once it has been waited for.
    pub fn vacate(&mut self, pid: u32) {
        if self.running.as_ref().is_some_and(|t| t.pid == pid) {
            self.running = None;
        }
    }

    pub fn current_pid(&self) -> Option<u32> {
        self.running.as_ref().map(|t| t.pid)
    }

    /// Refuse every later `run_tool` call.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// SIGTERM the running tool's process group, then SIGKILL it if it is
    /// still around after `grace_period`. Returns false if nothing was running.
    pub fn stop(&mut self, grace_period: Duration) -> bool {
        let Some(tool) = self.running.take() else {
            return false;
        };

        info!("Stopping {} (PID {})", tool.program, tool.pid);
        signal_tool(tool.pid, Signal::SIGTERM);

        let deadline = Instant::now() + grace_period;
        while Instant::now() < deadline {
            if !is_process_alive(tool.pid) {
                debug!("{} exited after SIGTERM", tool.program);
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        if is_process_alive(tool.pid) {
            error!("{} ignored SIGTERM, killing it", tool.program);
            signal_tool(tool.pid, Signal::SIGKILL);
        }
        true
    }
}

/// Record the stage the engine is about to enter.
pub fn note_active_stage(stage: ProvisionStage) {
    ACTIVE_STAGE.store(stage.order(), Ordering::SeqCst);
}

/// Mark the engine idle again (run finished or failed and reported).
pub fn clear_active_stage() {
    ACTIVE_STAGE.store(ProvisionStage::Unwiped.order(), Ordering::SeqCst);
}

/// Stage most recently recorded with `note_active_stage`.
pub fn active_stage() -> ProvisionStage {
    ProvisionStage::from_order(ACTIVE_STAGE.load(Ordering::SeqCst))
        .unwrap_or(ProvisionStage::Unwiped)
}

/// Signal the tool's process group, or the tool alone if it has none.
fn signal_tool(pid: u32, sig: Signal) {
    let raw = pid as i32;
    if let Err(group_err) = signal::kill(Pid::from_raw(-raw), sig) {
        debug!("No process group {} ({}), signalling the PID", pid, group_err);
        if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
            warn!("Failed to send {} to PID {}: {}", sig, pid, e);
        }
    }
}

/// True while `pid` exists and is not a zombie.
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // The state follows the parenthesised command name in /proc/<pid>/stat
    let state = std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next().map(str::to_string))
        });
    !matches!(state.as_deref(), Some("Z" | "X"))
}

/// Stops whatever tool is still running when dropped.
///
/// Held by the CLI around a provisioning run, so an early return or a panic
/// does not leave `mkfs` writing to the disk.
#[derive(Debug, Default)]
pub struct ProcessGuard {
    _private: (),
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = ToolSlot::global().lock()
            && slot.stop(Duration::from_secs(5))
        {
            warn!("A storage tool was still running when provisioning ended");
        }
    }
}

/// Initialize signal handlers for SIGINT, SIGTERM and SIGHUP.
///
/// On a signal no further tool is started, the running one is stopped, the
/// interrupted stage is logged, and the process exits with `128 + signal`.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let name = Signal::try_from(sig).map(|s| s.as_str()).unwrap_or("signal");
            warn!("Received {}, stopping storage tools", name);

            if let Ok(mut slot) = ToolSlot::global().lock() {
                slot.close();
                slot.stop(Duration::from_secs(3));
            }

            let stage = active_stage();
            if stage != ProvisionStage::Unwiped {
                error!(
                    "Interrupted while entering '{}'. The target device is partially \
                     provisioned and needs manual recovery before re-running.",
                    stage
                );
            }

            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run in a fresh process group and die with the provisioner
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Child dies with us instead of finishing a wipe unattended
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    #[test]
    fn test_slot_tracks_one_tool() {
        let mut slot = ToolSlot::default();
        assert_eq!(slot.current_pid(), None);

        slot.occupy(1234, "sgdisk");
        assert_eq!(slot.current_pid(), Some(1234));

        // Some other PID exiting does not free the slot
        slot.vacate(5678);
        assert_eq!(slot.current_pid(), Some(1234));

        slot.vacate(1234);
        assert_eq!(slot.current_pid(), None);
    }

    #[test]
    fn test_stop_terminates_running_tool() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sleep process");

        let mut slot = ToolSlot::default();
        slot.occupy(child.id(), "sh");
        assert!(is_process_alive(child.id()));

        assert!(slot.stop(Duration::from_secs(2)));
        assert_eq!(slot.current_pid(), None);

        let status = child.wait().expect("wait");
        assert!(status.signal().is_some(), "sleep exited on its own: {status:?}");
    }

    #[test]
    fn test_stop_with_nothing_running() {
        let mut slot = ToolSlot::default();
        assert!(!slot.stop(Duration::from_millis(10)));

        // A PID that is long gone is only signalled once, then forgotten
        slot.occupy(999_999, "mkfs.ext4");
        assert!(slot.stop(Duration::from_millis(10)));
        assert!(!slot.stop(Duration::from_millis(10)));
    }

    #[test]
    fn test_closed_slot_stays_closed() {
        let mut slot = ToolSlot::default();
        assert!(!slot.is_closed());
        slot.close();
        slot.stop(Duration::from_millis(10));
        assert!(slot.is_closed());
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
    }

}
