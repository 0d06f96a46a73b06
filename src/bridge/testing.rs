//! Scripted shells for relay and server tests

use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::ssh::{ConnectionRecord, SessionBroker, ShellControl, ShellSession, TransportError};

#[derive(Debug, PartialEq)]
pub(crate) enum ControlEvent {
    Stdin(Vec<u8>),
    Resize(u32, u32),
    Closed,
}

/// How a scripted shell treats stdin writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stdin {
    Accept,
    Fail,
    /// Never completes, like a remote that stopped reading
    Stall,
}

pub(crate) struct MockControl {
    events: mpsc::UnboundedSender<ControlEvent>,
    stdin: Stdin,
}

#[async_trait]
impl ShellControl for MockControl {
    async fn write_stdin(&mut self, data: &[u8]) -> io::Result<()> {
        match self.stdin {
            Stdin::Accept => {
                let _ = self.events.send(ControlEvent::Stdin(data.to_vec()));
                Ok(())
            }
            Stdin::Fail => Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
            Stdin::Stall => std::future::pending().await,
        }
    }

    async fn resize(&mut self, cols: u32, rows: u32) -> io::Result<()> {
        let _ = self.events.send(ControlEvent::Resize(cols, rows));
        Ok(())
    }

    async fn close(self) {
        let _ = self.events.send(ControlEvent::Closed);
    }
}

/// The far side of a scripted shell
pub(crate) struct ShellPeer {
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    pub events: mpsc::UnboundedReceiver<ControlEvent>,
}

pub(crate) fn scripted_shell(stdin: Stdin) -> (ShellSession<MockControl>, ShellPeer) {
    let (stdout_tx, stdout_rx) = tokio::io::duplex(4096);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(4096);
    let (events_tx, events) = mpsc::unbounded_channel();

    let session = ShellSession {
        id: "s-1".to_string(),
        control: MockControl {
            events: events_tx,
            stdin,
        },
        stdout: Box::pin(stdout_rx),
        stderr: Box::pin(stderr_rx),
    };

    (
        session,
        ShellPeer {
            stdout: stdout_tx,
            stderr: stderr_tx,
            events,
        },
    )
}

/// Broker that hands out one scripted result
pub(crate) struct MockBroker {
    result: Mutex<Option<Result<ShellSession<MockControl>, TransportError>>>,
}

impl MockBroker {
    pub(crate) fn new(result: Result<ShellSession<MockControl>, TransportError>) -> Self {
        Self {
            result: Mutex::new(Some(result)),
        }
    }
}

#[async_trait]
impl SessionBroker for MockBroker {
    type Control = MockControl;

    async fn open(
        &self,
        _record: &ConnectionRecord,
    ) -> Result<ShellSession<MockControl>, TransportError> {
        self.result
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(TransportError::ShellError("already opened".into())))
    }
}
