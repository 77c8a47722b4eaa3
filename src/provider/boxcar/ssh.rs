//! Blocking SSH and SFTP operations against a booted VM.
//!
//! These run inside `spawn_blocking` over a TCP stream the async caller
//! dialled. The caller keeps a clone of that stream and shuts it down to
//! cancel a session: a blocked read then fails promptly, the helper
//! returns, and the caller awaits it before reporting cancellation.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

use camino::Utf8PathBuf;
use ssh2::{ExtendedData, Session};
use tokio::sync::mpsc;

use crate::provider::{InstanceError, RunResult};

pub(super) const BUILD_SCRIPT: &str = "build.sh";
pub(super) const WRAPPER_SCRIPT: &str = "wrapper.sh";

/// Credentials and connection settings for reaching job VMs.
#[derive(Clone, Debug)]
pub(super) struct SshAccess {
    pub key_path: Utf8PathBuf,
    pub key_passphrase: String,
    pub user: String,
    pub port: u16,
}

fn ssh_err(err: impl std::fmt::Display) -> InstanceError {
    InstanceError::Ssh {
        message: err.to_string(),
    }
}

fn open_session(access: &SshAccess, tcp: TcpStream) -> Result<Session, InstanceError> {
    let key = std::fs::read_to_string(&access.key_path)
        .map_err(|err| ssh_err(format!("reading key {}: {err}", access.key_path)))?;
    let mut session = Session::new().map_err(ssh_err)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(ssh_err)?;
    session
        .userauth_pubkey_memory(&access.user, None, &key, Some(&access.key_passphrase))
        .map_err(ssh_err)?;
    Ok(session)
}

/// Writes the build script and its wrapper to the instance home directory.
///
/// A `build.sh` already present means the VM was recycled unclean; the
/// upload is refused so the job can be requeued onto a fresh instance.
pub(super) fn upload_script(
    access: &SshAccess,
    tcp: TcpStream,
    script: &[u8],
    wrapper: &[u8],
) -> Result<(), InstanceError> {
    let session = open_session(access, tcp)?;
    let sftp = session.sftp().map_err(ssh_err)?;

    if sftp.stat(Path::new(BUILD_SCRIPT)).is_ok() {
        return Err(InstanceError::StaleVm);
    }

    let mut file = sftp.create(Path::new(BUILD_SCRIPT)).map_err(ssh_err)?;
    file.write_all(script).map_err(ssh_err)?;
    drop(file);

    let mut file = sftp.create(Path::new(WRAPPER_SCRIPT)).map_err(ssh_err)?;
    file.write_all(wrapper).map_err(ssh_err)?;
    Ok(())
}

/// Runs the wrapper script under an xterm PTY, forwarding merged
/// stdout/stderr chunks to `output` until the command ends, the receiver
/// hangs up, or the underlying stream is shut down by the caller.
pub(super) fn run_script(
    access: &SshAccess,
    tcp: TcpStream,
    output: mpsc::Sender<Vec<u8>>,
) -> Result<RunResult, InstanceError> {
    let session = open_session(access, tcp)?;
    let mut channel = session.channel_session().map_err(ssh_err)?;
    channel
        .handle_extended_data(ExtendedData::Merge)
        .map_err(ssh_err)?;
    channel
        .request_pty("xterm", None, Some((80, 40, 0, 0)))
        .map_err(ssh_err)?;
    channel
        .exec(&format!("bash ~/{WRAPPER_SCRIPT}"))
        .map_err(ssh_err)?;

    let mut buffer = [0_u8; 8192];
    loop {
        let read = channel.read(&mut buffer).map_err(ssh_err)?;
        if read == 0 {
            break;
        }
        if output.blocking_send(buffer[..read].to_vec()).is_err() {
            break;
        }
    }

    channel.wait_close().ok();
    let exit_code = channel.exit_status().map_err(ssh_err)?;
    Ok(RunResult {
        completed: true,
        exit_code,
    })
}
