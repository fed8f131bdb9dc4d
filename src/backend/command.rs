//! Tool execution for the real storage backend.
//!
//! `run_tool` is the only place a storage tool gets spawned. It guarantees:
//!
//! - Process group isolation and a parent-death signal for the child
//! - The running tool occupies the global `ToolSlot` so an interrupt can stop it
//! - Arguments come from a typed `ToolArgs` struct, never a format string

use crate::backend::{PartitionRequest, StorageBackend};
use crate::process_guard::{CommandProcessGroup, ToolSlot};
use crate::tools::{
    MkfsArgs, MountArgs, PartprobeArgs, SgdiskClearArgs, SgdiskNewArgs, SubvolumeCreateArgs,
    ToolArgs, UdevSettleArgs, UmountArgs, WipeFsArgs,
};
use crate::types::FilesystemKind;
use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Output from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Standard output from the tool.
    pub stdout: String,
    /// Standard error from the tool.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the tool exited successfully (exit code 0).
    pub success: bool,
}

impl ToolOutput {
    /// Check if the tool succeeded and return an error carrying its stderr if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            let detail = if self.stderr.trim().is_empty() {
                self.stdout.trim()
            } else {
                self.stderr.trim()
            };
            bail!("{} failed (exit code {}): {}", context, code, detail)
        }
    }
}

/// Execute a tool with type-safe arguments and wait for it to exit.
///
/// A non-zero exit is not an error here; callers decide through
/// `ToolOutput::ensure_success`. Failing to spawn or wait is.
pub fn run_tool<T: ToolArgs>(args: &T) -> Result<ToolOutput> {
    let program = args.program();
    let cli_args = args.to_cli_args();

    info!("run_tool: {}", args.command_line());

    let mut cmd = Command::new(program);
    cmd.args(&cli_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    for (key, value) in args.get_env_vars() {
        cmd.env(key, value);
    }

    // Closing the slot and spawning a tool are serialized by its lock
    let child = {
        let mut slot = ToolSlot::global()
            .lock()
            .map_err(|_| anyhow::anyhow!("tool slot lock poisoned"))?;
        if slot.is_closed() {
            bail!("Interrupted, not starting {}", program);
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;
        slot.occupy(child.id(), program);
        child
    };
    let pid = child.id();

    let output = child.wait_with_output();

    if let Ok(mut slot) = ToolSlot::global().lock() {
        slot.vacate(pid);
    }

    let output = output.with_context(|| format!("Failed waiting for {}", program))?;

    let result = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };

    if result.success {
        debug!("{} exited successfully", program);
    } else {
        warn!(
            "{} failed with exit code {}",
            program,
            result.exit_code.unwrap_or(-1)
        );
    }

    Ok(result)
}

/// Run a tool and turn a non-zero exit into an error.
fn run_checked<T: ToolArgs>(args: &T) -> Result<ToolOutput> {
    let output = run_tool(args)?;
    output.ensure_success(&args.command_line())?;
    Ok(output)
}

/// Backend that drives the real Linux storage tools.
#[derive(Debug, Default)]
pub struct CommandBackend;

impl CommandBackend {
    pub fn new() -> Self {
        Self
    }
}

impl StorageBackend for CommandBackend {
    fn wipe_signatures(&mut self, target: &Path) -> Result<()> {
        run_checked(&WipeFsArgs {
            target: target.to_path_buf(),
        })?;
        Ok(())
    }

    fn create_partition_table(&mut self, device: &Path) -> Result<()> {
        run_checked(&SgdiskClearArgs {
            disk: device.to_path_buf(),
        })?;
        Ok(())
    }

    fn create_partition(&mut self, device: &Path, request: &PartitionRequest) -> Result<()> {
        run_checked(&SgdiskNewArgs {
            disk: device.to_path_buf(),
            number: request.number,
            start_sector: request.start_sector(),
            end_sector: request.end_sector(),
            role: request.role,
            bootable: request.bootable,
        })?;
        run_checked(&PartprobeArgs {
            disk: device.to_path_buf(),
        })?;
        run_checked(&UdevSettleArgs)?;
        Ok(())
    }

    fn format(
        &mut self,
        partition: &Path,
        filesystem: FilesystemKind,
        label: Option<&str>,
    ) -> Result<()> {
        run_checked(&MkfsArgs {
            device: partition.to_path_buf(),
            filesystem,
            label: label.map(str::to_string),
        })?;
        Ok(())
    }

    fn mount(&mut self, source: &Path, target: &Path, options: Option<&str>) -> Result<()> {
        run_checked(&MountArgs {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options: options.map(str::to_string),
        })?;
        Ok(())
    }

    fn create_subvolume(&mut self, mounted_root: &Path, name: &str) -> Result<()> {
        run_checked(&SubvolumeCreateArgs {
            mounted_root: mounted_root.to_path_buf(),
            name: name.to_string(),
        })?;
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        run_checked(&UmountArgs {
            target: target.to_path_buf(),
        })?;
        Ok(())
    }

    fn create_dir(&mut self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create mount point {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `sh -c SCRIPT`, so tests can exercise `run_tool` without storage tools.
    struct ShellArgs(&'static str);

    impl ToolArgs for ShellArgs {
        fn program(&self) -> &'static str {
            "sh"
        }

        fn to_cli_args(&self) -> Vec<String> {
            vec!["-c".to_string(), self.0.to_string()]
        }
    }

    #[test]
    fn test_run_tool_captures_output() {
        let output = run_tool(&ShellArgs("echo hello; echo oops >&2")).expect("sh should spawn");
        assert!(output.success);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[test]
    fn test_run_tool_reports_exit_code() {
        let output = run_tool(&ShellArgs("echo 'device busy' >&2; exit 3")).expect("sh should spawn");
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));

        let err = output.ensure_success("mkfs.ext4").expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("mkfs.ext4"));
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("device busy"));
    }

    #[test]
    fn test_run_tool_sets_c_locale() {
        let output = run_tool(&ShellArgs("printf %s \"$LC_ALL\"")).expect("sh should spawn");
        assert_eq!(output.stdout, "C");
    }

    #[test]
    fn test_ensure_success_falls_back_to_stdout() {
        let output = ToolOutput {
            stdout: "Problem opening /dev/sdz".to_string(),
            stderr: String::new(),
            exit_code: Some(2),
            success: false,
        };
        let msg = output
            .ensure_success("sgdisk")
            .expect_err("must fail")
            .to_string();
        assert!(msg.contains("Problem opening /dev/sdz"));
    }

    #[test]
    fn test_spawn_failure_is_error() {
        struct Missing;
        impl ToolArgs for Missing {
            fn program(&self) -> &'static str {
                "archprov-no-such-tool"
            }
            fn to_cli_args(&self) -> Vec<String> {
                Vec::new()
            }
        }
        assert!(run_tool(&Missing).is_err());
    }

    #[test]
    fn test_create_dir_is_recursive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("mnt").join("boot");
        CommandBackend::new()
            .create_dir(&target)
            .expect("create_dir");
        assert!(target.is_dir());
    }
}
