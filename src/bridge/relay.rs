//! Relay Engine
//!
//! Owns one session from the first status frame to channel closure:
//!
//! ```text
//! Connecting ──open ok──▶ Streaming ──shutdown──▶ Closing ──▶ Closed
//!      └──────────open failed (one Error frame)──────────────────▲
//! ```
//!
//! While streaming, four tasks share one single-fire shutdown signal:
//! the stdout forwarder, the stderr forwarder, the inbound pump (runs on the
//! caller's task and is the only stdin writer) and the optional idle
//! watchdog. Every outbound frame goes through one writer task that owns the
//! [`FrameSink`], so frames never interleave on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{Frame, FrameSink, FrameSource, ProtocolError};
use crate::ssh::{ConnectionRecord, OutputStream, SessionBroker, ShellControl, TransportError};

/// Bytes read from a shell stream per output frame
const READ_BUFFER_SIZE: usize = 1024;

/// Frames queued for the writer task
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Bound on a single frame write to the external channel
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on releasing the shell and joining session tasks
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub const STATUS_CONNECTED: &str = "Connected!";
pub const STATUS_CLOSED: &str = "Connection closed";

/// Relay lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Streaming,
    Closing,
    Closed,
}

/// What ended a streaming session (first detector wins)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Shell stdout reached end-of-stream or failed
    StdoutClosed,
    /// Writing to shell stdin failed
    InputFailed,
    /// External channel closed or its transport failed
    ChannelClosed,
    /// Undecodable inbound frame
    Protocol,
    /// No traffic in either direction for the idle bound
    IdleTimeout,
    /// Writing to the external channel failed or timed out
    OutboundFailed,
}

impl ShutdownReason {
    /// Whether the peer can still be told the session ended
    pub fn peer_reachable(self) -> bool {
        !matches!(
            self,
            ShutdownReason::ChannelClosed | ShutdownReason::OutboundFailed
        )
    }
}

/// Result of one relay run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// A shell was opened and streamed
    pub connected: bool,
    /// `None` when the shell never opened
    pub reason: Option<ShutdownReason>,
}

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Close sessions with no traffic for this long; `None` disables the bound
    pub idle_timeout: Option<Duration>,
}

/// Single-fire shutdown signal shared by the session tasks
///
/// Carries the first reason; later fires are no-ops.
#[derive(Clone)]
struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Shutdown {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    fn fire(&self, reason: ShutdownReason) {
        let first = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            debug!("Shutdown fired: {:?}", reason);
        }
    }

    async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }

    fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    fn peer_gone(&self) -> bool {
        self.reason().is_some_and(|r| !r.peer_reachable())
    }
}

/// Last traffic timestamp, in millis since session start
struct Activity {
    started: Instant,
    last: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last.load(Ordering::Relaxed)))
    }
}

/// Decodes a byte stream to text without splitting multi-byte characters
/// across frames
#[derive(Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Decode `chunk`, holding back an incomplete trailing sequence
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = &buf[..];

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        out.push_str(text);
                    }
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is still held back at end-of-stream
    pub(crate) fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Bridges external channels to shells opened by a [`SessionBroker`]
pub struct Relay<B: SessionBroker> {
    broker: B,
    config: RelayConfig,
}

impl<B: SessionBroker> Relay<B> {
    pub fn new(broker: B, config: RelayConfig) -> Self {
        Self { broker, config }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Serve one external channel until the session ends
    pub async fn run<T, R>(&self, record: &ConnectionRecord, sink: T, mut source: R) -> RelayOutcome
    where
        T: FrameSink,
        R: FrameSource,
    {
        let target = record.target();
        let shutdown = Shutdown::new();
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_CAPACITY);
        let writer = tokio::spawn(run_writer(sink, frame_rx, shutdown.clone()));

        debug!("Relay for {} entering {:?}", target, RelayState::Connecting);
        let _ = frame_tx
            .send(Frame::status(format!("Connecting to {}...", target)))
            .await;

        let session = match self.broker.open(record).await {
            Ok(session) => session,
            Err(e) => {
                warn!("SSH connection to {} failed: {}", target, e);
                let _ = frame_tx.send(Frame::error(error_message(&e))).await;
                drop(frame_tx);
                finish_writer(writer, true).await;
                debug!("Relay for {} entering {:?}", target, RelayState::Closed);
                return RelayOutcome {
                    connected: false,
                    reason: None,
                };
            }
        };

        let (sid, mut control, stdout, stderr) = session.into_parts();
        info!("Relay streaming session {} for {}", sid, target);
        debug!("Relay for session {} entering {:?}", sid, RelayState::Streaming);

        let _ = frame_tx.send(Frame::status(STATUS_CONNECTED)).await;

        let activity = Arc::new(Activity::new());

        let stdout_task = tokio::spawn(forward_output(
            stdout,
            StreamKind::Stdout,
            frame_tx.clone(),
            shutdown.clone(),
            activity.clone(),
            sid.clone(),
        ));
        let stderr_task = tokio::spawn(forward_output(
            stderr,
            StreamKind::Stderr,
            frame_tx.clone(),
            shutdown.clone(),
            activity.clone(),
            sid.clone(),
        ));
        let idle_task = self.config.idle_timeout.map(|limit| {
            tokio::spawn(watch_idle(
                limit,
                activity.clone(),
                shutdown.clone(),
                sid.clone(),
            ))
        });

        // Inbound pump: sole writer of shell stdin
        loop {
            let next = tokio::select! {
                _ = shutdown.fired() => break,
                next = source.recv() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(ProtocolError::Malformed(e))) => {
                    warn!("Malformed frame on session {}: {}", sid, e);
                    shutdown.fire(ShutdownReason::Protocol);
                    break;
                }
                Some(Err(e)) => {
                    debug!("External channel failed for session {}: {}", sid, e);
                    shutdown.fire(ShutdownReason::ChannelClosed);
                    break;
                }
                None => {
                    info!("External channel closed for session {}", sid);
                    shutdown.fire(ShutdownReason::ChannelClosed);
                    break;
                }
            };

            activity.touch();

            match frame {
                Frame::Input { data } => {
                    if data.is_empty() {
                        continue;
                    }
                    // A stalled shell must not hold the pump past shutdown
                    let written = tokio::select! {
                        _ = shutdown.fired() => break,
                        written = control.write_stdin(data.as_bytes()) => written,
                    };
                    if let Err(e) = written {
                        warn!("Failed to write stdin for session {}: {}", sid, e);
                        shutdown.fire(ShutdownReason::InputFailed);
                        break;
                    }
                }
                Frame::Resize { cols, rows } => match geometry(cols, rows) {
                    Some((cols, rows)) => {
                        debug!("Resize request: {}x{} for session {}", cols, rows, sid);
                        let resized = tokio::select! {
                            _ = shutdown.fired() => break,
                            resized = control.resize(cols, rows) => resized,
                        };
                        if let Err(e) = resized {
                            debug!("Resize failed for session {}: {}", sid, e);
                        }
                    }
                    None => debug!(
                        "Ignoring resize {}x{} for session {}",
                        cols, rows, sid
                    ),
                },
                other => debug!("Ignoring inbound frame {:?} for session {}", other, sid),
            }
        }

        let reason = shutdown.reason();
        debug!(
            "Relay for session {} entering {:?} ({:?})",
            sid,
            RelayState::Closing,
            reason
        );

        if tokio::time::timeout(CLOSE_TIMEOUT, control.close())
            .await
            .is_err()
        {
            warn!("Shell for session {} did not close in time", sid);
        }

        join_bounded(stdout_task, "stdout forwarder", &sid).await;
        join_bounded(stderr_task, "stderr forwarder", &sid).await;
        if let Some(task) = idle_task {
            join_bounded(task, "idle watchdog", &sid).await;
        }

        let peer_reachable = reason.map_or(true, ShutdownReason::peer_reachable);
        if peer_reachable {
            let _ = frame_tx.send(Frame::status(STATUS_CLOSED)).await;
        }
        drop(frame_tx);
        finish_writer(writer, peer_reachable).await;

        info!("Relay for session {} closed ({:?})", sid, reason);
        debug!("Relay for session {} entering {:?}", sid, RelayState::Closed);

        RelayOutcome {
            connected: true,
            reason,
        }
    }
}

/// Text of the single Error frame for a failed open
fn error_message(err: &TransportError) -> String {
    match err {
        TransportError::ShellError(msg) => msg.clone(),
        other => format!("SSH connection failed: {}", other),
    }
}

/// Resize geometry, if both dimensions are positive and fit the wire type
fn geometry(cols: i64, rows: i64) -> Option<(u32, u32)> {
    let cols = u32::try_from(cols).ok().filter(|c| *c > 0)?;
    let rows = u32::try_from(rows).ok().filter(|r| *r > 0)?;
    Some((cols, rows))
}

/// Writer task: the only caller of [`FrameSink::send`]
async fn run_writer<T: FrameSink>(
    mut sink: T,
    mut rx: mpsc::Receiver<Frame>,
    shutdown: Shutdown,
) -> T {
    while let Some(frame) = rx.recv().await {
        if shutdown.peer_gone() {
            debug!("Peer gone, dropping queued frames");
            break;
        }

        match tokio::time::timeout(SEND_TIMEOUT, sink.send(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Frame write failed: {}", e);
                shutdown.fire(ShutdownReason::OutboundFailed);
                break;
            }
            Err(_) => {
                warn!(
                    "Frame write timed out after {}s - peer unresponsive, disconnecting",
                    SEND_TIMEOUT.as_secs()
                );
                shutdown.fire(ShutdownReason::OutboundFailed);
                break;
            }
        }
    }
    debug!("Frame writer stopped");
    sink
}

/// Wait for the writer to drain, then close the sink if the peer is still there
async fn finish_writer<T: FrameSink>(writer: JoinHandle<T>, close: bool) {
    let mut sink = match writer.await {
        Ok(sink) => sink,
        Err(e) => {
            warn!("Frame writer task failed: {}", e);
            return;
        }
    };

    if close {
        match tokio::time::timeout(SEND_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing external channel failed: {}", e),
            Err(_) => debug!("Closing external channel timed out"),
        }
    }
}

async fn forward_output(
    mut stream: OutputStream,
    kind: StreamKind,
    tx: mpsc::Sender<Frame>,
    shutdown: Shutdown,
    activity: Arc<Activity>,
    sid: String,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut carry = Utf8Carry::default();

    loop {
        let read = tokio::select! {
            _ = shutdown.fired() => break,
            read = stream.read(&mut buf) => read,
        };

        let text = match read {
            Ok(0) => {
                let rest = carry.finish();
                if !rest.is_empty() {
                    let _ = tx.send(Frame::output(rest)).await;
                }
                debug!("{:?} reached end-of-stream for session {}", kind, sid);
                if kind == StreamKind::Stdout {
                    shutdown.fire(ShutdownReason::StdoutClosed);
                }
                break;
            }
            Ok(n) => carry.decode(&buf[..n]),
            Err(e) => {
                // stderr is best-effort: its failure ends only this forwarder
                debug!("{:?} read failed for session {}: {}", kind, sid, e);
                if kind == StreamKind::Stdout {
                    shutdown.fire(ShutdownReason::StdoutClosed);
                }
                break;
            }
        };

        activity.touch();
        if text.is_empty() {
            continue;
        }

        tokio::select! {
            _ = shutdown.fired() => break,
            sent = tx.send(Frame::output(text)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!("{:?} forwarder stopped for session {}", kind, sid);
}

async fn watch_idle(limit: Duration, activity: Arc<Activity>, shutdown: Shutdown, sid: String) {
    loop {
        let idle = activity.idle_for();
        if idle >= limit {
            warn!(
                "Session {} idle for {}s, closing",
                sid,
                idle.as_secs()
            );
            shutdown.fire(ShutdownReason::IdleTimeout);
            break;
        }

        tokio::select! {
            _ = shutdown.fired() => break,
            _ = tokio::time::sleep(limit - idle) => {}
        }
    }
}

async fn join_bounded(task: JoinHandle<()>, what: &str, sid: &str) {
    let abort = task.abort_handle();
    if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
        warn!("{} for session {} did not stop in time, aborting", what, sid);
        abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::{scripted_shell, ControlEvent, MockBroker, Stdin};
    use crate::config::vault::SecretBlob;
    use crate::ssh::AuthVariant;
    use async_trait::async_trait;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// Source fed by the test, able to inject decode errors
    struct ScriptedSource(mpsc::Receiver<Result<Frame, ProtocolError>>);

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn recv(&mut self) -> Option<Result<Frame, ProtocolError>> {
            self.0.recv().await
        }
    }

    struct FailingSink;

    #[async_trait]
    impl FrameSink for FailingSink {
        async fn send(&mut self, _frame: &Frame) -> Result<(), ProtocolError> {
            Err(ProtocolError::Transport("broken pipe".into()))
        }

        async fn close(&mut self) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    /// Sink that records frames written once the test has hung up
    #[derive(Clone, Default)]
    struct RecordingSink {
        written: Arc<std::sync::Mutex<Vec<Frame>>>,
        hung_up: Arc<std::sync::atomic::AtomicBool>,
        late: Arc<std::sync::Mutex<Vec<Frame>>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
            if self.hung_up.load(Ordering::SeqCst) {
                self.late.lock().unwrap().push(frame.clone());
            }
            self.written.lock().unwrap().push(frame.clone());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ProtocolError> {
            if self.hung_up.load(Ordering::SeqCst) {
                self.late.lock().unwrap().push(Frame::Unknown);
            }
            Ok(())
        }
    }

    fn record() -> ConnectionRecord {
        ConnectionRecord {
            host: "10.0.0.5".to_string(),
            port: 22,
            username: "deploy".to_string(),
            auth: AuthVariant::Password,
            secret: SecretBlob::new("unused"),
        }
    }

    struct Harness {
        stdout: DuplexStream,
        stderr: DuplexStream,
        events: mpsc::UnboundedReceiver<ControlEvent>,
        inbound: mpsc::Sender<Result<Frame, ProtocolError>>,
        outbound: mpsc::Receiver<Frame>,
        task: JoinHandle<RelayOutcome>,
    }

    fn start(config: RelayConfig, stdin: Stdin) -> Harness {
        let (session, peer) = scripted_shell(stdin);
        let broker = MockBroker::new(Ok(session));

        let (inbound, source_rx) = mpsc::channel(16);
        let (sink, outbound) = mpsc::channel(64);
        let relay = Arc::new(Relay::new(broker, config));
        let task = tokio::spawn(async move {
            relay
                .run(&record(), sink, ScriptedSource(source_rx))
                .await
        });

        Harness {
            stdout: peer.stdout,
            stderr: peer.stderr,
            events: peer.events,
            inbound,
            outbound,
            task,
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
    }

    async fn expect_connected(rx: &mut mpsc::Receiver<Frame>) {
        assert_eq!(
            next_frame(rx).await,
            Some(Frame::status("Connecting to deploy@10.0.0.5:22..."))
        );
        assert_eq!(next_frame(rx).await, Some(Frame::status(STATUS_CONNECTED)));
    }

    async fn outcome(task: JoinHandle<RelayOutcome>) -> RelayOutcome {
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("relay did not finish")
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_failure_sends_single_error() {
        let broker = MockBroker::new(Err(TransportError::ConnectError(
            "failed to connect to 10.0.0.5:22: connection refused".into(),
        )));
        let relay = Relay::new(broker, RelayConfig::default());
        let (sink, mut outbound) = mpsc::channel(16);
        let (_inbound, source_rx) = mpsc::channel::<Result<Frame, ProtocolError>>(1);

        let result = relay.run(&record(), sink, ScriptedSource(source_rx)).await;

        assert_eq!(
            result,
            RelayOutcome {
                connected: false,
                reason: None
            }
        );
        assert_eq!(
            outbound.recv().await,
            Some(Frame::status("Connecting to deploy@10.0.0.5:22..."))
        );
        assert_eq!(
            outbound.recv().await,
            Some(Frame::error(
                "SSH connection failed: failed to connect to 10.0.0.5:22: connection refused"
            ))
        );
        assert_eq!(outbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_shell_error_message_passes_through() {
        let broker = MockBroker::new(Err(TransportError::ShellError(
            "Failed to request PTY: rejected".into(),
        )));
        let relay = Relay::new(broker, RelayConfig::default());
        let (sink, mut outbound) = mpsc::channel(16);
        let (_inbound, source_rx) = mpsc::channel::<Result<Frame, ProtocolError>>(1);

        relay.run(&record(), sink, ScriptedSource(source_rx)).await;

        outbound.recv().await;
        assert_eq!(
            outbound.recv().await,
            Some(Frame::error("Failed to request PTY: rejected"))
        );
    }

    #[tokio::test]
    async fn test_input_is_written_verbatim() {
        let mut h = start(RelayConfig::default(), Stdin::Accept);
        expect_connected(&mut h.outbound).await;

        let data = "héllo ✓\x1b[A\x03\r".to_string();
        h.inbound
            .send(Ok(Frame::Input { data: data.clone() }))
            .await
            .unwrap();

        assert_eq!(
            h.events.recv().await,
            Some(ControlEvent::Stdin(data.into_bytes()))
        );

        drop(h.inbound);
        assert_eq!(
            outcome(h.task).await.reason,
            Some(ShutdownReason::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_invalid_resize_is_ignored() {
        let mut h = start(RelayConfig::default(), Stdin::Accept);
        expect_connected(&mut h.outbound).await;

        for (cols, rows) in [(0, 24), (80, 0), (-1, 24), (i64::MAX, 24), (120, 40)] {
            h.inbound
                .send(Ok(Frame::Resize { cols, rows }))
                .await
                .unwrap();
        }
        h.inbound.send(Ok(Frame::Unknown)).await.unwrap();

        assert_eq!(h.events.recv().await, Some(ControlEvent::Resize(120, 40)));

        drop(h.inbound);
        outcome(h.task).await;
        assert_eq!(h.events.recv().await, Some(ControlEvent::Closed));
    }

    #[tokio::test]
    async fn test_stdout_end_sends_final_status() {
        let mut h = start(RelayConfig::default(), Stdin::Accept);
        expect_connected(&mut h.outbound).await;

        h.stdout.write_all(b"hi\r\n").await.unwrap();
        assert_eq!(next_frame(&mut h.outbound).await, Some(Frame::output("hi\r\n")));

        drop(h.stdout);
        assert_eq!(
            next_frame(&mut h.outbound).await,
            Some(Frame::status(STATUS_CLOSED))
        );
        assert_eq!(next_frame(&mut h.outbound).await, None);

        let result = outcome(h.task).await;
        assert!(result.connected);
        assert_eq!(result.reason, Some(ShutdownReason::StdoutClosed));
        assert_eq!(h.events.recv().await, Some(ControlEvent::Closed));
    }

    #[tokio::test]
    async fn test_channel_close_sends_nothing_more() {
        let mut h = start(RelayConfig::default(), Stdin::Accept);
        expect_connected(&mut h.outbound).await;

        drop(h.inbound);

        let result = outcome(h.task).await;
        assert_eq!(result.reason, Some(ShutdownReason::ChannelClosed));
        assert_eq!(h.outbound.recv().await, None);
        assert_eq!(h.events.recv().await, Some(ControlEvent::Closed));
        drop(h.stdout);
    }

    #[tokio::test]
    async fn test_no_writes_after_hang_up_during_output() {
        let (session, mut peer) = scripted_shell(Stdin::Accept);
        let relay = Arc::new(Relay::new(MockBroker::new(Ok(session)), RelayConfig::default()));
        let sink = RecordingSink::default();
        let (inbound, source_rx) = mpsc::channel(16);

        let task = tokio::spawn({
            let relay = relay.clone();
            let sink = sink.clone();
            async move { relay.run(&record(), sink, ScriptedSource(source_rx)).await }
        });

        // Keep the shell talking through the hang-up
        let mut stdout = peer.stdout;
        let ticker = tokio::spawn(async move {
            loop {
                if stdout.write_all(b"tick\n").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !sink
            .written
            .lock()
            .unwrap()
            .iter()
            .any(|f| matches!(f, Frame::Output { .. }))
        {
            assert!(Instant::now() < deadline, "no output forwarded");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(inbound);
        // The control is released only after the shutdown reason is set
        assert_eq!(peer.events.recv().await, Some(ControlEvent::Closed));
        sink.hung_up.store(true, Ordering::SeqCst);

        assert_eq!(outcome(task).await.reason, Some(ShutdownReason::ChannelClosed));
        ticker.abort();

        assert!(
            sink.late.lock().unwrap().is_empty(),
            "frames after hang-up: {:?}",
            sink.late.lock().unwrap()
        );
        assert!(!sink
            .written
            .lock()
            .unwrap()
            .contains(&Frame::status(STATUS_CLOSED)));
    }

    #[tokio::test]
    async fn test_malformed_frame_shuts_down() {
        let mut h = start(RelayConfig::default(), Stdin::Accept);
        expect_connected(&mut h.outbound).await;

        h.inbound
            .send(Err(ProtocolError::Malformed("not json".into())))
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut h.outbound).await,
            Some(Frame::status(STATUS_CLOSED))
        );
        assert_eq!(outcome(h.task).await.reason, Some(ShutdownReason::Protocol));
    }

    #[tokio::test]
    async fn test_stdin_failure_shuts_down() {
        let mut h = start(RelayConfig::default(), Stdin::Fail);
        expect_connected(&mut h.outbound).await;

        h.inbound
            .send(Ok(Frame::Input {
                data: "ls\r".into(),
            }))
            .await
            .unwrap();

        assert_eq!(outcome(h.task).await.reason, Some(ShutdownReason::InputFailed));
    }

    #[tokio::test]
    async fn test_stderr_is_forwarded_and_best_effort() {
        let mut h = start(RelayConfig::default(), Stdin::Accept);
        expect_connected(&mut h.outbound).await;

        h.stderr.write_all(b"warning\n").await.unwrap();
        assert_eq!(
            next_frame(&mut h.outbound).await,
            Some(Frame::output("warning\n"))
        );

        // Losing stderr alone keeps the session up
        drop(h.stderr);
        h.stdout.write_all(b"still here").await.unwrap();
        assert_eq!(
            next_frame(&mut h.outbound).await,
            Some(Frame::output("still here"))
        );
        assert!(!h.task.is_finished());

        drop(h.inbound);
        outcome(h.task).await;
    }

    #[tokio::test]
    async fn test_split_utf8_is_not_mangled() {
        let mut h = start(RelayConfig::default(), Stdin::Accept);
        expect_connected(&mut h.outbound).await;

        let bytes = "✓!".as_bytes();
        h.stdout.write_all(&bytes[..2]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.stdout.write_all(&bytes[2..]).await.unwrap();
        drop(h.stdout);

        let mut text = String::new();
        while let Some(Frame::Output { data }) = next_frame(&mut h.outbound).await {
            text.push_str(&data);
        }
        assert_eq!(text, "✓!");
        outcome(h.task).await;
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_session() {
        let mut h = start(
            RelayConfig {
                idle_timeout: Some(Duration::from_millis(200)),
            },
            Stdin::Accept,
        );
        expect_connected(&mut h.outbound).await;

        let started = Instant::now();
        assert_eq!(
            next_frame(&mut h.outbound).await,
            Some(Frame::status(STATUS_CLOSED))
        );
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(outcome(h.task).await.reason, Some(ShutdownReason::IdleTimeout));
        assert_eq!(h.events.recv().await, Some(ControlEvent::Closed));
    }

    #[tokio::test]
    async fn test_idle_timeout_fires_while_stdin_is_stalled() {
        let mut h = start(
            RelayConfig {
                idle_timeout: Some(Duration::from_millis(200)),
            },
            Stdin::Stall,
        );
        expect_connected(&mut h.outbound).await;

        h.inbound
            .send(Ok(Frame::Input {
                data: "cat > /dev/null\r".into(),
            }))
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut h.outbound).await,
            Some(Frame::status(STATUS_CLOSED))
        );
        assert_eq!(next_frame(&mut h.outbound).await, None);
        assert_eq!(outcome(h.task).await.reason, Some(ShutdownReason::IdleTimeout));
        assert_eq!(h.events.recv().await, Some(ControlEvent::Closed));
    }

    #[tokio::test]
    async fn test_stdout_end_while_stdin_is_stalled() {
        let mut h = start(RelayConfig::default(), Stdin::Stall);
        expect_connected(&mut h.outbound).await;

        h.inbound
            .send(Ok(Frame::Input { data: "x".into() }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(h.stdout);

        assert_eq!(
            next_frame(&mut h.outbound).await,
            Some(Frame::status(STATUS_CLOSED))
        );
        assert_eq!(outcome(h.task).await.reason, Some(ShutdownReason::StdoutClosed));
    }

    #[tokio::test]
    async fn test_outbound_failure_shuts_down() {
        let (session, mut peer) = scripted_shell(Stdin::Accept);
        let broker = MockBroker::new(Ok(session));
        let relay = Relay::new(broker, RelayConfig::default());
        let (_inbound, source_rx) = mpsc::channel::<Result<Frame, ProtocolError>>(1);

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            relay.run(&record(), FailingSink, ScriptedSource(source_rx)),
        )
        .await
        .unwrap();

        assert!(result.connected);
        assert_eq!(result.reason, Some(ShutdownReason::OutboundFailed));
        assert_eq!(peer.events.recv().await, Some(ControlEvent::Closed));
    }

    #[test]
    fn test_utf8_carry() {
        let mut carry = Utf8Carry::default();
        let check = "a✓b".as_bytes();

        assert_eq!(carry.decode(&check[..2]), "a");
        assert_eq!(carry.decode(&check[2..3]), "");
        assert_eq!(carry.decode(&check[3..]), "✓b");
        assert_eq!(carry.finish(), "");

        // Invalid bytes are replaced, not carried
        assert_eq!(carry.decode(b"x\xffy"), "x\u{FFFD}y");

        // A dangling prefix at end-of-stream is flushed lossily
        assert_eq!(carry.decode(&[b'z', 0xe2]), "z");
        assert_eq!(carry.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_geometry() {
        assert_eq!(geometry(80, 24), Some((80, 24)));
        assert_eq!(geometry(0, 24), None);
        assert_eq!(geometry(80, -24), None);
        assert_eq!(geometry(1 << 40, 24), None);
    }

    #[tokio::test]
    async fn test_shutdown_first_reason_wins() {
        let shutdown = Shutdown::new();
        assert_eq!(shutdown.reason(), None);

        shutdown.fire(ShutdownReason::StdoutClosed);
        shutdown.fire(ShutdownReason::ChannelClosed);

        assert_eq!(shutdown.reason(), Some(ShutdownReason::StdoutClosed));
        assert!(!shutdown.peer_gone());

        // Late waiters still see the signal
        tokio::time::timeout(Duration::from_secs(1), shutdown.fired())
            .await
            .unwrap();
    }
}
