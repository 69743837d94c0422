//! Length-prefixed frames carried by streaming responses.
//!
//! ```text
//! +----------+-----------+----------------+------------------------+
//! | reserved | kind      | payload length | payload                |
//! | CR LF    | u16 BE    | u32 BE         | UTF-8 JSON or raw      |
//! +----------+-----------+----------------+------------------------+
//!   2 bytes    2 bytes     4 bytes          `length` bytes
//! ```
//!
//! An empty payload stands for `{}` when JSON decoding is on.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::SyncwireResult;
use crate::error::Error;

pub const HEADER_LEN: usize = 8;
const RESERVED: [u8; 2] = *b"\r\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameKind(pub u16);

impl FrameKind {
    /// Terminates a stream session.
    pub const END: Self = Self(0xF0F0);

    pub const fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for FrameKind {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{:#06x}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FramePayload {
    Json(Value),
    Raw(Bytes),
}

impl FramePayload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Json(_) => None,
            Self::Raw(bytes) => Some(bytes),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamMessage {
    pub kind: FrameKind,
    pub payload: FramePayload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Frame(StreamMessage),
    /// Not enough bytes yet. `kind` is known once the header is buffered.
    Incomplete { kind: Option<FrameKind> },
}

fn payload_length(len: usize) -> SyncwireResult<u32> {
    u32::try_from(len).map_err(|_| Error::FrameTooLarge { len })
}

pub fn encode_raw_frame(kind: FrameKind, payload: &[u8]) -> SyncwireResult<Bytes> {
    let length = payload_length(payload.len())?;
    let mut buffer = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buffer.put_slice(&RESERVED);
    buffer.put_u16(kind.0);
    buffer.put_u32(length);
    buffer.put_slice(payload);
    Ok(buffer.freeze())
}

pub fn encode_frame(kind: FrameKind, message: &Value) -> SyncwireResult<Bytes> {
    let payload = serde_json::to_vec(message).map_err(|source| Error::Serialize {
        source: source.into(),
    })?;
    encode_raw_frame(kind, &payload)
}

/// Pulls one frame off the front of `buffer`.
///
/// On `Incomplete` the buffer is left exactly as it was.
pub fn decode_frame(buffer: &mut BytesMut, decode_json: bool) -> SyncwireResult<Decoded> {
    if buffer.len() < HEADER_LEN {
        return Ok(Decoded::Incomplete { kind: None });
    }

    let kind = FrameKind(u16::from_be_bytes([buffer[2], buffer[3]]));
    let length = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    if buffer.len() - HEADER_LEN < length {
        return Ok(Decoded::Incomplete { kind: Some(kind) });
    }

    buffer.advance(HEADER_LEN);
    let payload = buffer.split_to(length).freeze();
    let payload = if !decode_json {
        FramePayload::Raw(payload)
    } else if payload.is_empty() {
        FramePayload::Json(Value::Object(serde_json::Map::new()))
    } else {
        let value = serde_json::from_slice(&payload).map_err(|source| Error::Deserialize {
            source: source.into(),
            body: crate::util::truncate_body(&payload),
        })?;
        FramePayload::Json(value)
    };

    Ok(Decoded::Frame(StreamMessage { kind, payload }))
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use serde_json::json;

    use super::{
        Decoded, FrameKind, FramePayload, HEADER_LEN, StreamMessage, decode_frame, encode_frame,
        encode_raw_frame, payload_length,
    };
    use crate::error::Error;

    fn frames(buffer: &mut BytesMut) -> Vec<StreamMessage> {
        let mut decoded = Vec::new();
        while let Decoded::Frame(message) = decode_frame(buffer, true).expect("frame should decode")
        {
            decoded.push(message);
        }
        decoded
    }

    #[test]
    fn header_layout_matches_wire_format() {
        let encoded = encode_raw_frame(FrameKind(7), b"{}").expect("encode");
        assert_eq!(&encoded[..HEADER_LEN], &[b'\r', b'\n', 0, 7, 0, 0, 0, 2]);
        assert_eq!(&encoded[HEADER_LEN..], b"{}");
    }

    #[test]
    fn decodes_json_frame() {
        let encoded = encode_frame(FrameKind(7), &json!({"a": 1})).expect("frame should encode");
        let mut buffer = BytesMut::from(&encoded[..]);

        let decoded = decode_frame(&mut buffer, true).expect("frame should decode");
        assert_eq!(
            decoded,
            Decoded::Frame(StreamMessage {
                kind: FrameKind(7),
                payload: FramePayload::Json(json!({"a": 1})),
            })
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn split_at_every_boundary_yields_exactly_one_frame() {
        let encoded = encode_frame(FrameKind(7), &json!({"a": 1})).expect("frame should encode");

        for split in 0..=encoded.len() {
            let mut buffer = BytesMut::new();
            buffer.put_slice(&encoded[..split]);
            let mut decoded = frames(&mut buffer);
            if split < encoded.len() {
                assert!(decoded.is_empty(), "split {split} decoded early");
                assert_eq!(&buffer[..], &encoded[..split], "split {split} lost bytes");
            }

            buffer.put_slice(&encoded[split..]);
            decoded.extend(frames(&mut buffer));
            assert_eq!(decoded.len(), 1, "split {split}");
            assert_eq!(decoded[0].kind, FrameKind(7));
            assert_eq!(decoded[0].payload, FramePayload::Json(json!({"a": 1})));
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn partial_payload_reports_known_kind() {
        let encoded = encode_frame(FrameKind::END, &json!({"done": true})).expect("encode");
        let mut buffer = BytesMut::from(&encoded[..HEADER_LEN + 2]);

        let decoded = decode_frame(&mut buffer, true).expect("decode");
        assert_eq!(
            decoded,
            Decoded::Incomplete {
                kind: Some(FrameKind::END)
            }
        );
        assert_eq!(buffer.len(), HEADER_LEN + 2);

        let mut short = BytesMut::from(&encoded[..3]);
        assert_eq!(
            decode_frame(&mut short, true).expect("decode"),
            Decoded::Incomplete { kind: None }
        );
    }

    #[test]
    fn empty_payload_is_empty_object() {
        let encoded = encode_raw_frame(FrameKind::END, &[]).expect("encode");
        let mut buffer = BytesMut::from(&encoded[..]);
        let decoded = decode_frame(&mut buffer, true).expect("decode");
        assert_eq!(
            decoded,
            Decoded::Frame(StreamMessage {
                kind: FrameKind::END,
                payload: FramePayload::Json(json!({})),
            })
        );
    }

    #[test]
    fn raw_mode_skips_json_decoding() {
        let encoded = encode_raw_frame(FrameKind(3), b"\x00\xffnot json").expect("encode");
        let mut buffer = BytesMut::from(&encoded[..]);
        let decoded = decode_frame(&mut buffer, false).expect("decode");
        match decoded {
            Decoded::Frame(message) => {
                assert_eq!(
                    message.payload.as_bytes().map(|bytes| &bytes[..]),
                    Some(&b"\x00\xffnot json"[..])
                );
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn several_frames_in_one_chunk_keep_order() {
        let mut buffer = BytesMut::new();
        for index in 0..3_u16 {
            buffer.put_slice(&encode_frame(FrameKind(index), &json!({ "n": index })).expect("encode"));
        }
        let kinds = frames(&mut buffer)
            .into_iter()
            .map(|message| message.kind.value())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec![0, 1, 2]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_payload_length_is_rejected() {
        assert_eq!(payload_length(u32::MAX as usize).expect("fits"), u32::MAX);
        let len = u32::MAX as usize + 1;
        match payload_length(len) {
            Err(Error::FrameTooLarge { len: rejected }) => assert_eq!(rejected, len),
            other => panic!("expected frame too large, got {other:?}"),
        }
    }
}
