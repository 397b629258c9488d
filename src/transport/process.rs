//! Reach the peer through a child process's stdin/stdout.
//!
//! Typically `ssh host blobsync /srv/blobs stdio`, which runs the remote side
//! with its stdio transport. The child's stderr is inherited so remote logs
//! show up locally.

use super::Duplex;
use std::ffi::OsStr;
use std::io;
use std::process::Stdio;
use tokio::process::Command;

pub fn spawn<I, S>(program: impl AsRef<OsStr>, args: I) -> io::Result<Duplex>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdout unavailable"))?;

    tracing::debug!(
        "Spawned {} (pid {:?})",
        program.to_string_lossy(),
        child.id()
    );
    let peer = program.to_string_lossy().into_owned();
    Ok(Duplex::new(stdout, stdin, peer).with_child(child))
}
