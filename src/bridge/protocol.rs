//! Frame protocol for the external channel
//!
//! One JSON object per channel message:
//!
//! ```text
//! {"type":"status","message":"Connected!"}
//! {"type":"error","message":"SSH connection failed: ..."}
//! {"type":"output","data":"..."}
//! {"type":"input","data":"ls\r"}
//! {"type":"resize","cols":120,"rows":40}
//! ```
//!
//! Decoding is lenient: absent or null fields take their zero value and unknown or
//! missing `type` tags decode to [`Frame::Unknown`], which the relay ignores.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;

/// Protocol errors on the external channel
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("channel closed")]
    Closed,

    #[error("channel transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// One atomic message on the external channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Status {
        #[serde(default, deserialize_with = "null_as_default")]
        message: String,
    },
    Error {
        #[serde(default, deserialize_with = "null_as_default")]
        message: String,
    },
    Output {
        #[serde(default, deserialize_with = "null_as_default")]
        data: String,
    },
    Input {
        #[serde(default, deserialize_with = "null_as_default")]
        data: String,
    },
    Resize {
        #[serde(default, deserialize_with = "null_as_default")]
        cols: i64,
        #[serde(default, deserialize_with = "null_as_default")]
        rows: i64,
    },
    #[serde(other)]
    Unknown,
}

/// `null` reads as the zero value, like an absent field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Frame {
    pub fn status(message: impl Into<String>) -> Self {
        Frame::Status {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        Frame::Output { data: data.into() }
    }

    /// Decode one frame from a channel message
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let Some(object) = value.as_object() else {
            return Err(ProtocolError::Malformed(
                "frame is not a JSON object".to_string(),
            ));
        };

        if !object.contains_key("type") {
            return Ok(Frame::Unknown);
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Encode as a single JSON text message
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Write half of the external channel
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one complete frame
    async fn send(&mut self, frame: &Frame) -> Result<(), ProtocolError>;

    /// Close the channel gracefully
    async fn close(&mut self) -> Result<(), ProtocolError>;
}

/// Read half of the external channel
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame, or `None` once the channel is closed
    async fn recv(&mut self) -> Option<Result<Frame, ProtocolError>>;
}

/// In-process channel, for embedding the relay behind another transport
#[async_trait]
impl FrameSink for mpsc::Sender<Frame> {
    async fn send(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        mpsc::Sender::send(self, frame.clone())
            .await
            .map_err(|_| ProtocolError::Closed)
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

#[async_trait]
impl FrameSource for mpsc::Receiver<Frame> {
    async fn recv(&mut self) -> Option<Result<Frame, ProtocolError>> {
        mpsc::Receiver::recv(self).await.map(Ok)
    }
}
