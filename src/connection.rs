//! Length-delimited JSON framing over a single stream (C1).
use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Messages are small fixed-shape JSON objects; 1 MiB is generous headroom
/// while still bounding a malicious or buggy peer's memory impact.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// A type usable as the underlying transport for a [`Connection`].
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnectionStream for T {}

/// Send and receive [`Message`] values over a length-prefixed byte stream.
///
/// Framing (the `u32` length prefix) is handled by
/// [`tokio_util::codec::LengthDelimitedCodec`]; encoding/decoding the JSON
/// body happens here. Frames whose body fails to parse — including those
/// carrying an unrecognized `type` — are silently skipped rather than
/// treated as a connection error, so one malformed message never kills the
/// socket.
pub struct Connection<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S: ConnectionStream> Connection<S> {
    pub fn new(stream: S) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_type::<u32>()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();

        Self {
            framed: Framed::new(stream, codec),
        }
    }

    /// Read the next well-formed [`Message`] from the stream, skipping any
    /// number of malformed or unrecognized frames along the way.
    ///
    /// Returns `Ok(None)` on a clean EOF.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.framed.next().await {
                None => return Ok(None),
                Some(Err(err)) => {
                    if err.kind() == std::io::ErrorKind::InvalidData && err.to_string().contains("too big") {
                        return Err(Error::FrameTooLarge(MAX_FRAME_LEN));
                    }
                    return Err(Error::Io(err));
                }
                Some(Ok(bytes)) => match serde_json::from_slice::<Message>(&bytes) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(err) => {
                        debug!(error = %err, "dropping malformed or unknown frame");
                        continue;
                    }
                },
            }
        }
    }

    pub async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let body = serde_json::to_vec(msg)?;
        self.framed.send(Bytes::from(body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use bytes::{BufMut, BytesMut};

    fn encode(msg: &Message) -> Vec<u8> {
        let body = serde_json::to_vec(msg).unwrap();
        let mut out = BytesMut::with_capacity(4 + body.len());
        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        out.to_vec()
    }

    #[tokio::test]
    async fn reads_a_single_message() {
        let msg = Message::new(2, MessageType::Request, 17);
        let bytes = encode(&msg);

        let stream = tokio_test::io::Builder::new().read(&bytes).build();
        let mut conn = Connection::new(stream);

        let got = conn.read_message().await.unwrap().unwrap();
        assert_eq!(got.sender, 2);
        assert_eq!(got.kind, MessageType::Request);
        assert_eq!(got.timestamp, 17);
    }

    #[tokio::test]
    async fn skips_unknown_type_then_reads_next() {
        let bad_body: &[u8] = br#"{"sender":1,"type":"BOGUS","timestamp":1}"#;
        let mut bad = BytesMut::new();
        bad.put_u32(bad_body.len() as u32);
        bad.put_slice(bad_body);

        let good = Message::new(3, MessageType::Answer, 4);
        let good_bytes = encode(&good);

        let mut all = bad.to_vec();
        all.extend_from_slice(&good_bytes);

        let stream = tokio_test::io::Builder::new().read(&all).build();
        let mut conn = Connection::new(stream);

        let got = conn.read_message().await.unwrap().unwrap();
        assert_eq!(got.sender, 3);
        assert_eq!(got.kind, MessageType::Answer);
    }

    #[tokio::test]
    async fn oversized_frame_is_reported_as_frame_too_large() {
        let mut prefix = BytesMut::new();
        prefix.put_u32((MAX_FRAME_LEN + 1) as u32);

        let stream = tokio_test::io::Builder::new().read(&prefix).build();
        let mut conn = Connection::new(stream);

        let err = conn.read_message().await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(MAX_FRAME_LEN)));
    }

    #[tokio::test]
    async fn eof_yields_none() {
        let stream = tokio_test::io::Builder::new().build();
        let mut conn = Connection::new(stream);
        assert!(conn.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let msg = Message::new(5, MessageType::Coordinator, 9);
        let bytes = encode(&msg);

        let stream = tokio_test::io::Builder::new().write(&bytes).build();
        let mut conn = Connection::new(stream);
        conn.write_message(&msg).await.unwrap();
    }
}
