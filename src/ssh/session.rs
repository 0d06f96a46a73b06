//! SSH Session management
//!
//! A live shell is split into three independently owned parts:
//!
//! - a [`ShellControl`] (stdin writes, window changes, close) held by the inbound pump
//! - a stdout [`OutputStream`] read by the stdout forwarder
//! - a stderr [`OutputStream`] read by the stderr forwarder
//!
//! For SSH, one owner task holds both the russh `Handle` and the session `Channel`.
//! It feeds channel data into in-process pipes and applies [`ShellCommand`]s, so
//! the transport is never touched concurrently and is torn down exactly once.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::client::ClientHandler;
use super::config::ConnectionRecord;
use super::error::TransportError;

/// Capacity of each in-process output pipe
const PIPE_CAPACITY: usize = 64 * 1024;

/// Pending stdin/resize commands per shell
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on waiting for the owner task to tear the transport down
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read side of a shell output stream
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Write/control side of an interactive shell
///
/// `close` consumes the control, so a released shell cannot be used again.
#[async_trait]
pub trait ShellControl: Send + 'static {
    /// Write bytes to the shell's stdin, verbatim
    async fn write_stdin(&mut self, data: &[u8]) -> io::Result<()>;

    /// Change the terminal geometry
    async fn resize(&mut self, cols: u32, rows: u32) -> io::Result<()>;

    /// Close the shell and its transport
    async fn close(self);
}

/// Turns a connection record into a live shell
#[async_trait]
pub trait SessionBroker: Send + Sync + 'static {
    type Control: ShellControl;

    async fn open(
        &self,
        record: &ConnectionRecord,
    ) -> Result<ShellSession<Self::Control>, TransportError>;
}

/// A PTY-backed shell, owned by exactly one relay
pub struct ShellSession<C> {
    pub id: String,
    pub control: C,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

impl<C: ShellControl> ShellSession<C> {
    /// Consumes the session and returns its parts
    #[must_use = "into_parts transfers ownership - ignoring the result will leak resources"]
    pub fn into_parts(self) -> (String, C, OutputStream, OutputStream) {
        (self.id, self.control, self.stdout, self.stderr)
    }
}

/// Commands that can be sent to the SSH shell owner
#[derive(Debug)]
pub enum ShellCommand {
    /// Data to send to SSH stdin
    Data(Bytes),
    /// Resize the PTY
    Resize { cols: u32, rows: u32 },
    /// Close the channel and disconnect
    Close,
}

/// Aborts the owner task when dropped
///
/// Dropping a `JoinHandle` only detaches the task, so without this a cancelled
/// `close` would leave the russh handle and channel alive.
struct OwnerGuard(AbortHandle);

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// [`ShellControl`] for a shell running over an SSH channel
pub struct SshShell {
    id: String,
    cmd_tx: mpsc::Sender<ShellCommand>,
    owner: JoinHandle<()>,
    guard: OwnerGuard,
}

impl SshShell {
    fn new(id: String, cmd_tx: mpsc::Sender<ShellCommand>, owner: JoinHandle<()>) -> Self {
        let guard = OwnerGuard(owner.abort_handle());
        Self {
            id,
            cmd_tx,
            owner,
            guard,
        }
    }
}

#[async_trait]
impl ShellControl for SshShell {
    async fn write_stdin(&mut self, data: &[u8]) -> io::Result<()> {
        self.cmd_tx
            .send(ShellCommand::Data(Bytes::copy_from_slice(data)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "shell channel closed"))
    }

    async fn resize(&mut self, cols: u32, rows: u32) -> io::Result<()> {
        self.cmd_tx
            .send(ShellCommand::Resize { cols, rows })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "shell channel closed"))
    }

    async fn close(self) {
        // Held across the join: the owner is aborted on every exit path,
        // including cancellation of this future
        let SshShell {
            id,
            cmd_tx,
            owner,
            guard: _guard,
        } = self;

        // A full queue must not delay teardown; the owner also stops once
        // every sender is gone
        if let Err(e) = cmd_tx.try_send(ShellCommand::Close) {
            debug!("Close command not queued for session {}: {}", id, e);
        }
        drop(cmd_tx);

        match tokio::time::timeout(CLOSE_TIMEOUT, owner).await {
            Ok(_) => debug!("Shell owner for session {} joined", id),
            Err(_) => warn!("Shell owner for session {} did not stop in time, aborting", id),
        }
    }
}

/// Spawn the owner task for an opened shell channel
pub(crate) fn spawn_shell_owner(
    handle: Handle<ClientHandler>,
    channel: Channel<Msg>,
    session_id: String,
) -> ShellSession<SshShell> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<ShellCommand>(COMMAND_CHANNEL_CAPACITY);
    let (stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);

    let owner = tokio::spawn(run_shell_owner(
        handle,
        channel,
        cmd_rx,
        stdout_tx,
        stderr_tx,
        session_id.clone(),
    ));

    ShellSession {
        id: session_id.clone(),
        control: SshShell::new(session_id, cmd_tx, owner),
        stdout: Box::pin(stdout_rx),
        stderr: Box::pin(stderr_rx),
    }
}

async fn run_shell_owner(
    handle: Handle<ClientHandler>,
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    stdout_tx: DuplexStream,
    stderr_tx: DuplexStream,
    sid: String,
) {
    debug!("Shell owner started for session {}", sid);

    let mut stdout = Some(stdout_tx);
    let mut stderr = Some(stderr_tx);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ShellCommand::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            error!("Failed to send data to SSH channel: {}", e);
                            break;
                        }
                    }
                    Some(ShellCommand::Resize { cols, rows }) => {
                        debug!("Sending window_change: {}x{} for session {}", cols, rows, sid);
                        if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                            warn!("Failed to resize PTY: {}", e);
                        }
                    }
                    Some(ShellCommand::Close) | None => {
                        info!("Close requested for session {}", sid);
                        let _ = channel.eof().await;
                        break;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if let Some(out) = stdout.as_mut() {
                            if out.write_all(&data).await.is_err() {
                                debug!("stdout reader gone for session {}", sid);
                                stdout = None;
                            }
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext 1 is SSH_EXTENDED_DATA_STDERR
                        if ext == 1 {
                            if let Some(err) = stderr.as_mut() {
                                if err.write_all(&data).await.is_err() {
                                    debug!("stderr reader gone for session {}", sid);
                                    stderr = None;
                                }
                            }
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("SSH channel exit status {} for session {}", exit_status, sid);
                    }
                    Some(ChannelMsg::Eof) => {
                        info!("SSH channel EOF for session {}", sid);
                        break;
                    }
                    Some(ChannelMsg::Close) | None => {
                        info!("SSH channel closed for session {}", sid);
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    // Dropping the pipe writers signals end-of-stream to the forwarders
    drop(stdout);
    drop(stderr);

    let _ = channel.close().await;
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
        .await
    {
        debug!("Disconnect for session {} failed: {}", sid, e);
    }

    info!("Shell owner terminated for session {}", sid);
}
