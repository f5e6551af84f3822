/*!
Local ZFS snapshots: listing, size estimates, `zfs send` streams and `zfs recv` sinks.

The upload pipeline only needs a byte stream; everything that shells out to the `zfs`
binary lives here behind the [`SnapshotSource`] trait.
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{Output, Stdio};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::{BackupError, Result};

/// A stream of bytes produced by a snapshot source
pub type SnapshotStream = Box<dyn AsyncRead + Send + Unpin>;

/// One line of `zfs list -Ht snap -o name,used,refer,mountpoint,written`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSnapshot {
    /// Full name, `dataset@tag`
    pub name: String,
    pub used: String,
    pub refer: String,
    pub mountpoint: String,
    pub written: String,
}

impl LocalSnapshot {
    pub fn dataset(&self) -> &str {
        split_snapshot_name(&self.name).map(|(dataset, _)| dataset).unwrap_or(&self.name)
    }

    pub fn tag(&self) -> &str {
        split_snapshot_name(&self.name).map(|(_, tag)| tag).unwrap_or("")
    }
}

/// Split `dataset@tag` at the first `@`
pub fn split_snapshot_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('@')
}

/// The snapshots of one dataset that match a prefix, oldest first
///
/// Order is the order `zfs list` reported them in. A snapshot's parent for an
/// incremental send is the snapshot listed right before it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalSnapshots {
    snapshots: Vec<LocalSnapshot>,
}

impl LocalSnapshots {
    pub fn new(snapshots: Vec<LocalSnapshot>) -> Self {
        Self { snapshots }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalSnapshot> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&LocalSnapshot> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    pub fn latest(&self) -> Option<&LocalSnapshot> {
        self.snapshots.last()
    }

    /// The snapshot listed right before `name`
    pub fn parent_of(&self, name: &str) -> Option<&LocalSnapshot> {
        let index = self.snapshots.iter().position(|s| s.name == name)?;
        index.checked_sub(1).map(|i| &self.snapshots[i])
    }
}

/// Parse `zfs list -Ht snap -o name,used,refer,mountpoint,written` output
///
/// Only snapshots of `dataset` whose tag starts with `prefix` are kept, in the order
/// they were listed.
pub fn parse_snapshot_list(output: &str, dataset: &str, prefix: &str) -> Result<LocalSnapshots> {
    let mut snapshots = Vec::new();
    for line in output.lines().filter(|line| !line.is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let [name, used, refer, mountpoint, written] = fields[..] else {
            return Err(BackupError::validation(format!(
                "unexpected zfs list line '{line}': expected 5 tab separated fields"
            )));
        };
        let Some((fs, tag)) = split_snapshot_name(name) else {
            return Err(BackupError::validation(format!("'{name}' is not a snapshot name")));
        };
        if fs != dataset || !tag.starts_with(prefix) {
            continue;
        }
        snapshots.push(LocalSnapshot {
            name: name.to_string(),
            used: used.to_string(),
            refer: refer.to_string(),
            mountpoint: mountpoint.to_string(),
            written: written.to_string(),
        });
    }
    Ok(LocalSnapshots::new(snapshots))
}

/// Parse the size estimate from `zfs send -nvP` output
///
/// The last non-empty line is `size\t<bytes>`.
pub fn parse_estimated_size(output: &str) -> Result<u64> {
    let line = output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| BackupError::validation("empty zfs send -nvP output"))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields[..] {
        [_, size] => size
            .parse()
            .map_err(|_| BackupError::validation(format!("failed to parse size estimate from '{line}'"))),
        _ => Err(BackupError::validation(format!("failed to parse size estimate from '{line}'"))),
    }
}

/// Access to local snapshots and their send streams
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Snapshots of `dataset` whose tag starts with `prefix`, oldest first
    async fn list_snapshots(&self, dataset: &str, prefix: &str) -> Result<LocalSnapshots>;

    async fn dataset_exists(&self, dataset: &str) -> Result<bool>;

    /// Estimated size of the send stream, incremental from `parent` when given
    async fn estimate_size(&self, snapshot: &str, parent: Option<&str>) -> Result<u64>;

    /// Open the send stream of `snapshot`, incremental from `parent` when given
    ///
    /// The stream fails with an I/O error at its end if the sender did not exit cleanly.
    async fn open_stream(&self, snapshot: &str, parent: Option<&str>) -> Result<SnapshotStream>;
}

/// [`SnapshotSource`] backed by the `zfs` command line tool
#[derive(Debug, Clone)]
pub struct ZfsSendSource {
    binary: PathBuf,
}

impl Default for ZfsSendSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ZfsSendSource {
    pub fn new() -> Self {
        Self::with_binary("zfs")
    }

    pub fn with_binary<P: Into<PathBuf>>(binary: P) -> Self {
        Self { binary: binary.into() }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    async fn capture(&self, args: &[&str]) -> Result<String> {
        let description = self.describe(args);
        debug!(command = %description, "Running");
        let output = self.command(args).output().await?;
        check_exit(&description, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn send_args<'a>(snapshot: &'a str, parent: Option<&'a str>, dry_run: bool) -> Vec<&'a str> {
        let mut args = vec!["send"];
        if dry_run {
            args.push("-nvP");
        }
        if let Some(parent) = parent {
            args.extend(["-i", parent]);
        }
        args.push(snapshot);
        args
    }

    /// Start `zfs recv [-F] snapshot`; write the restored stream into the returned sink
    pub fn receive(&self, snapshot: &str, force: bool) -> Result<ReceiveSink> {
        let mut args = vec!["recv"];
        if force {
            args.push("-F");
        }
        args.push(snapshot);
        let description = self.describe(&args);
        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        info!(command = %description, "Starting receive");
        ReceiveSink::spawn(command, description)
    }
}

#[async_trait]
impl SnapshotSource for ZfsSendSource {
    async fn list_snapshots(&self, dataset: &str, prefix: &str) -> Result<LocalSnapshots> {
        let output = self
            .capture(&["list", "-Ht", "snap", "-o", "name,used,refer,mountpoint,written"])
            .await?;
        parse_snapshot_list(&output, dataset, prefix)
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let output = self.capture(&["list", "-H", "-o", "name"]).await?;
        Ok(output.lines().any(|line| line.trim() == dataset))
    }

    async fn estimate_size(&self, snapshot: &str, parent: Option<&str>) -> Result<u64> {
        let output = self.capture(&Self::send_args(snapshot, parent, true)).await?;
        parse_estimated_size(&output)
    }

    async fn open_stream(&self, snapshot: &str, parent: Option<&str>) -> Result<SnapshotStream> {
        let args = Self::send_args(snapshot, parent, false);
        let description = self.describe(&args);
        let mut command = self.command(&args);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        info!(command = %description, "Starting send");
        Ok(Box::new(SendStream::spawn(command, description)?))
    }
}

fn check_exit(description: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.contains("does not exist") || stderr.contains("could not find") {
        return Err(BackupError::not_found(format!("{description}: {stderr}")));
    }
    Err(BackupError::Io(io::Error::other(format!(
        "{description} exited with {}: {stderr}",
        output.status
    ))))
}

type ExitFuture = Pin<Box<dyn Future<Output = io::Result<Output>> + Send>>;

/// Stdout of a running command; reaching its end waits for the command to exit
pub struct SendStream {
    stdout: ChildStdout,
    exit: ExitFuture,
    description: String,
    done: bool,
}

impl SendStream {
    /// Spawn `command`, which must have piped stdout
    pub(crate) fn spawn(mut command: Command, description: String) -> Result<Self> {
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::validation(format!("{description}: stdout is not piped")))?;
        Ok(Self {
            stdout,
            exit: Box::pin(child.wait_with_output()),
            description,
            done: false,
        })
    }
}

impl AsyncRead for SendStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // end of stdout: the stream is only complete if the sender succeeded
        let output = ready!(this.exit.as_mut().poll(cx))?;
        this.done = true;
        if output.status.success() {
            debug!(command = %this.description, "Send finished");
            Poll::Ready(Ok(()))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Poll::Ready(Err(io::Error::other(format!(
                "{} exited with {}: {}",
                this.description,
                output.status,
                stderr.trim()
            ))))
        }
    }
}

/// Stdin of a running receiving command
pub struct ReceiveSink {
    stdin: ChildStdin,
    child: Child,
    description: String,
}

impl ReceiveSink {
    pub(crate) fn spawn(mut command: Command, description: String) -> Result<Self> {
        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackupError::validation(format!("{description}: stdin is not piped")))?;
        Ok(Self {
            stdin,
            child,
            description,
        })
    }

    /// Close stdin and wait for the receiver to accept the stream
    pub async fn finish(self) -> Result<()> {
        let Self {
            stdin,
            child,
            description,
        } = self;
        drop(stdin);
        let output = child.wait_with_output().await?;
        check_exit(&description, &output)?;
        info!(command = %description, "Receive finished");
        Ok(())
    }
}

impl AsyncWrite for ReceiveSink {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
