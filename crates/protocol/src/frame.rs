//! Length-delimited RPC frames.
//!
//! Every message between the orchestrator and a plugin is one frame: a u32
//! big-endian length prefix followed by that many bytes of JSON. The JSON is
//! a tagged enum:
//!
//! ```json
//! { "type": "methodCall", "payload": { "id": 1, "method": "describe", "body": null } }
//! ```
//!
//! Call correlation uses a caller-generated monotonically increasing id.
//! The channel never reorders: results and stream chunks are delivered in
//! the order frames are read. A broken length prefix or an undecodable frame
//! is a protocol violation ([`ChannelError::Corrupt`]) and is treated as a
//! plugin crash signal by the supervisor, never silently retried.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame's encoded size.
///
/// A prefix above this is treated as corruption rather than an allocation
/// request, so a garbage length can never make the reader reserve gigabytes.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Well-known method names a plugin must (or may) serve.
pub mod methods {
    /// Returns the plugin's declared steps. Required.
    pub const DESCRIBE: &str = "describe";
    /// Executes one step; streams log chunks, then returns a step result. Required.
    pub const EXECUTE_STEP: &str = "execute_step";
    /// Best-effort notification that the current run is being cancelled. Optional.
    pub const CANCEL: &str = "cancel";
    /// Asks the plugin to exit on its own. Optional.
    pub const SHUTDOWN: &str = "shutdown";
}

/// Errors surfaced by the transport channel.
///
/// Both variants are fatal to the session using the channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The underlying connection dropped (including clean EOF).
    #[error("channel closed")]
    Closed,

    /// A length prefix or frame body was invalid.
    #[error("corrupt frame: {reason}")]
    Corrupt { reason: String },
}

/// One message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Frame {
    /// A request from the orchestrator to the plugin.
    MethodCall {
        id: u64,
        method: String,
        body: Value,
    },

    /// The plugin's terminal answer to a [`Frame::MethodCall`].
    ///
    /// Exactly one of `body` / `error` is populated.
    MethodResult {
        id: u64,
        body: Option<Value>,
        error: Option<String>,
    },

    /// An intermediate streamed item belonging to an in-flight call.
    StreamChunk { id: u64, data: Value },

    /// Marks the end of the stream for an in-flight call.
    ///
    /// Always precedes the call's [`Frame::MethodResult`].
    StreamEnd { id: u64 },
}

impl Frame {
    /// The call id this frame belongs to.
    pub fn call_id(&self) -> u64 {
        match self {
            Frame::MethodCall { id, .. }
            | Frame::MethodResult { id, .. }
            | Frame::StreamChunk { id, .. }
            | Frame::StreamEnd { id } => *id,
        }
    }
}

/// Encode a frame and write it to `writer`.
///
/// # Errors
///
/// Returns [`ChannelError::Closed`] if the underlying write fails and
/// [`ChannelError::Corrupt`] if the frame serializes above [`MAX_FRAME_LEN`].
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame).map_err(|e| ChannelError::Corrupt {
        reason: format!("failed to encode frame: {e}"),
    })?;
    let len = u32::try_from(body.len()).map_err(|_| ChannelError::Corrupt {
        reason: "frame exceeds u32 length".to_string(),
    })?;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::Corrupt {
            reason: format!("frame of {len} bytes exceeds maximum {MAX_FRAME_LEN}"),
        });
    }

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|_| ChannelError::Closed)?;
    writer
        .write_all(&body)
        .await
        .map_err(|_| ChannelError::Closed)?;
    writer.flush().await.map_err(|_| ChannelError::Closed)?;
    Ok(())
}

/// Read one frame from `reader`, reassembling over the byte stream.
///
/// # Errors
///
/// Returns [`ChannelError::Closed`] on EOF or a failed read and
/// [`ChannelError::Corrupt`] on an invalid length prefix or undecodable body.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|_| ChannelError::Closed)?;

    let len = u32::from_be_bytes(prefix);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(ChannelError::Corrupt {
            reason: format!("invalid frame length {len}"),
        });
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| ChannelError::Closed)?;

    serde_json::from_slice(&body).map_err(|e| ChannelError::Corrupt {
        reason: format!("failed to decode frame: {e}"),
    })
}
