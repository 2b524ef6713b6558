//! Spawning helpers for the two supported stubs.
//!
//! Prefers macOS's debugserver when its fixed installation path exists,
//! falling back to `lldb-server gdbserver`. Either way the stub listens on
//! an ephemeral localhost port and the engine connects with retries.

use crate::debugger::error::Error;
use crate::debugger::{BinaryInfo, ConnectOptions, RemoteProcess};
use crate::weak_error;
use log::info;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const DEBUGSERVER_EXECUTABLE: &str = "/Library/Developer/CommandLineTools/Library/PrivateFrameworks/LLDB.framework/Versions/A/Resources/debugserver";

const CONNECT_ATTEMPTS: usize = 10;

/// Launch `cmd` under a freshly spawned stub and attach to it. `wd` is the
/// working directory for the inferior.
pub fn lldb_launch<B: BinaryInfo>(
    cmd: &[String],
    wd: Option<&Path>,
    bi: B,
) -> Result<RemoteProcess<B>, Error> {
    let Some(program) = cmd.first() else {
        return Err(Error::NotExecutable(PathBuf::new()));
    };
    if let Ok(meta) = std::fs::metadata(program) {
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(Error::NotExecutable(PathBuf::from(program)));
        }
    }

    let port = unused_port();
    let addr = format!("127.0.0.1:{port}");
    let (mut stub_cmd, is_debugserver) = if Path::new(DEBUGSERVER_EXECUTABLE).exists() {
        let mut c = Command::new(DEBUGSERVER_EXECUTABLE);
        c.arg(&addr).args(cmd);
        (c, true)
    } else {
        let mut c = Command::new("lldb-server");
        c.arg("gdbserver").arg(&addr).arg("--").args(cmd);
        (c, false)
    };
    if let Some(wd) = wd {
        stub_cmd.current_dir(wd);
    }
    stub_cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    info!(target: "debugger", "spawning stub on {addr}");
    let child = stub_cmd.spawn()?;

    let opts = ConnectOptions {
        executable: Some(program.clone()),
        pid: 0,
        attempts: CONNECT_ATTEMPTS,
    };
    attach_spawned(&addr, opts, bi, child, is_debugserver)
}

/// Spawn a stub attached to a running process and connect to it. `path`
/// only needs to be given for stubs that cannot report it themselves
/// (debugserver).
pub fn lldb_attach<B: BinaryInfo>(
    pid: u64,
    path: Option<String>,
    bi: B,
) -> Result<RemoteProcess<B>, Error> {
    let port = unused_port();
    let addr = format!("127.0.0.1:{port}");
    let (mut stub_cmd, is_debugserver) = if Path::new(DEBUGSERVER_EXECUTABLE).exists() {
        let mut c = Command::new(DEBUGSERVER_EXECUTABLE);
        c.arg(&addr).arg(format!("--attach={pid}"));
        (c, true)
    } else {
        let mut c = Command::new("lldb-server");
        c.arg("gdbserver")
            .arg("--attach")
            .arg(pid.to_string())
            .arg(&addr);
        (c, false)
    };
    stub_cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    info!(target: "debugger", "spawning stub on {addr} attached to {pid}");
    let child = stub_cmd.spawn()?;

    let opts = ConnectOptions {
        executable: path,
        pid,
        attempts: CONNECT_ATTEMPTS,
    };
    attach_spawned(&addr, opts, bi, child, is_debugserver)
}

fn attach_spawned<B: BinaryInfo>(
    addr: &str,
    opts: ConnectOptions,
    bi: B,
    mut child: std::process::Child,
    is_debugserver: bool,
) -> Result<RemoteProcess<B>, Error> {
    match RemoteProcess::connect(addr, opts, bi) {
        Ok(mut process) => {
            process.set_debugserver(is_debugserver);
            process.set_stub_process(child);
            Ok(process)
        }
        Err(e) => {
            weak_error!(child.kill(), "stop stub process:");
            weak_error!(child.wait(), "reap stub process:");
            Err(e)
        }
    }
}

/// Pick a currently unused TCP port. Racy with the rest of the system, but
/// ephemeral ports cycle before reuse under everything but extreme churn.
fn unused_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(8081)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unused_port_is_nonzero() {
        assert_ne!(unused_port(), 0);
    }

    #[test]
    fn launch_refuses_non_executable_files() {
        let path = std::env::temp_dir().join("gostalker-launch-test-data");
        std::fs::write(&path, b"not a binary").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&path, perms).unwrap();

        struct NoBi;
        impl BinaryInfo for NoBi {
            fn target_os(&self) -> crate::debugger::TargetOs {
                crate::debugger::TargetOs::Linux
            }
            fn pc_to_place(&self, _: u64) -> Option<crate::debugger::Place> {
                None
            }
            fn function_at(&self, _: u64) -> Option<String> {
                None
            }
            fn function_address(&self, _: &str) -> Option<u64> {
                None
            }
            fn g_struct_offset(&self) -> u64 {
                0
            }
        }

        let err = lldb_launch(&[path.to_string_lossy().into_owned()], None, NoBi).unwrap_err();
        assert!(matches!(err, Error::NotExecutable(_)));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn empty_command_line_is_rejected() {
        struct NoBi;
        impl BinaryInfo for NoBi {
            fn target_os(&self) -> crate::debugger::TargetOs {
                crate::debugger::TargetOs::Linux
            }
            fn pc_to_place(&self, _: u64) -> Option<crate::debugger::Place> {
                None
            }
            fn function_at(&self, _: u64) -> Option<String> {
                None
            }
            fn function_address(&self, _: &str) -> Option<u64> {
                None
            }
            fn g_struct_offset(&self) -> u64 {
                0
            }
        }
        assert!(matches!(
            lldb_launch(&[], None, NoBi),
            Err(Error::NotExecutable(_))
        ));
    }
}
