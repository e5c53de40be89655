//! Framed codec for host-worker byte streams.
//!
//! Each frame is a 4-byte big-endian length prefix followed by one JSON message.
//! Works over any AsyncRead/AsyncWrite (child stdio, sockets, duplex pipes).
//!
//! The length prefix comes from the peer, so it is capped: a corrupt or
//! misaligned prefix on a worker's stdout fails the stream with `InvalidData`
//! instead of making the reader buffer up to 4 GiB waiting for a frame that
//! will never complete. Suggestion lists are small; 1 MiB is far above any
//! real reply.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are refused in both directions.
/// Encoding an oversized message fails too, so the peer never sees a frame it must reject.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Length-prefixed JSON codec.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame_length)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        tracing::trace!(frame_bytes = frame.len(), "Decoding frame");
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Configuration, Incoming, Message, Token};

    #[test]
    fn frame_is_length_prefixed_json() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Message::Invalid { token: None }, &mut buf)
            .unwrap();

        let body = br#"{"message":"invalid","token":null}"#;
        assert_eq!(&buf[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], &body[..]);
    }

    #[test]
    fn worker_frames_decode_as_incoming() {
        let mut encoder = JsonCodec::<Message>::new();
        let mut decoder = JsonCodec::<Incoming>::new();
        let mut buf = BytesMut::new();

        let ready = Message::Ready {
            configuration: Configuration::new().with("leftContextCodeUnits", 16),
        };
        encoder.encode(ready.clone(), &mut buf).unwrap();

        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Incoming::Known(ready));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Message>::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                Message::Invalid {
                    token: Some(Token::new(9)),
                },
                &mut full,
            )
            .unwrap();

        let mut partial = full.split_to(full.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.token(), Some(Token::new(9)));
    }

    #[test]
    fn garbage_body_is_invalid_data() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"{x}");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn corrupt_length_prefix_fails_fast() {
        let mut codec = JsonCodec::<Incoming>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(br#"{"message":"ready"}"#);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut codec = JsonCodec::<Message>::with_max_frame_length(8);
        let mut buf = BytesMut::new();

        let result = codec.encode(
            Message::Initialize {
                model: "a-rather-long-model-name".to_string(),
                configuration: Configuration::new(),
            },
            &mut buf,
        );
        assert!(result.is_err());
    }
}
