//! Framed RPC connection to one plugin process.
//!
//! A [`Channel`] wraps the duplex byte stream negotiated during the
//! handshake (TCP or unix socket in production, an in-memory duplex in
//! tests) and exchanges [`Frame`]s over it. The channel belongs to the
//! plugin's supervisor handle and is lent to exactly one execution session
//! at a time; a plugin process serves one run at a time, so the channel is
//! never shared across sessions.

use pf_protocol::frame::{read_frame, write_frame, ChannelError, Frame};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte streams a channel can run over.
pub trait ChannelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelIo for T {}

/// A bidirectional, length-delimited message channel to one plugin.
pub struct Channel {
    io: Box<dyn ChannelIo>,
    next_call_id: u64,
}

impl Channel {
    /// Wrap an established duplex stream.
    pub fn new(io: Box<dyn ChannelIo>) -> Self {
        Self { io, next_call_id: 1 }
    }

    /// Allocate the next call correlation id.
    ///
    /// Ids increase monotonically; at most one call is in flight per id.
    pub fn next_call_id(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }

    /// Write one frame to the plugin.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        write_frame(&mut self.io, frame).await
    }

    /// Read the next frame from the plugin.
    ///
    /// Frames are delivered in the order they are read; this layer never
    /// reorders or retries.
    pub async fn recv(&mut self) -> Result<Frame, ChannelError> {
        read_frame(&mut self.io).await
    }

    /// Send a method call with a freshly allocated id and return that id.
    pub async fn call(&mut self, method: &str, body: Value) -> Result<u64, ChannelError> {
        let id = self.next_call_id();
        self.send(&Frame::MethodCall {
            id,
            method: method.to_string(),
            body,
        })
        .await?;
        Ok(id)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("next_call_id", &self.next_call_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_protocol::methods;
    use serde_json::json;

    fn channel_pair() -> (Channel, Channel) {
        let (a, b) = tokio::io::duplex(4096);
        (Channel::new(Box::new(a)), Channel::new(Box::new(b)))
    }

    #[tokio::test]
    async fn test_call_allocates_monotonic_ids() {
        let (mut caller, mut callee) = channel_pair();

        let first = caller.call(methods::DESCRIBE, Value::Null).await.unwrap();
        let second = caller
            .call(methods::EXECUTE_STEP, json!({ "step_index": 0 }))
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let frame = callee.recv().await.unwrap();
        assert!(matches!(frame, Frame::MethodCall { id: 1, .. }));
        let frame = callee.recv().await.unwrap();
        assert!(matches!(frame, Frame::MethodCall { id: 2, .. }));
    }

    #[tokio::test]
    async fn test_recv_preserves_frame_order() {
        let (mut caller, mut callee) = channel_pair();

        for i in 0..3u64 {
            callee
                .send(&Frame::StreamChunk {
                    id: 1,
                    data: json!({ "line": format!("line {i}"), "stream": "stdout" }),
                })
                .await
                .unwrap();
        }
        callee.send(&Frame::StreamEnd { id: 1 }).await.unwrap();

        for i in 0..3u64 {
            match caller.recv().await.unwrap() {
                Frame::StreamChunk { data, .. } => {
                    assert_eq!(data["line"], format!("line {i}"));
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(matches!(caller.recv().await.unwrap(), Frame::StreamEnd { id: 1 }));
    }

    #[tokio::test]
    async fn test_recv_after_peer_drop_is_closed() {
        let (mut caller, callee) = channel_pair();
        drop(callee);

        let err = caller.recv().await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }
}
