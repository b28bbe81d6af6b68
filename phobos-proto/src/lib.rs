//! Wire protocol: every message is one length-delimited frame on a
//! stream socket, carrying a JSON-encoded envelope with a stable, versioned
//! tag identifying its kind. Framing follows the same `tokio_util::codec`
//! idiom used elsewhere in this stack for chunk/payload streaming
//! (`FramedRead`/`BytesCodec`), generalised here to a length-prefixed
//! request/response codec since there is no HTTP layer
//! between LRS/TLC and their clients.

use anyhow::{bail, Error};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use phobos_api_types::{PhobosError, RequestId};

pub mod lrs;
pub mod tlc;

pub use lrs::{LrsRequest, LrsResponse};
pub use tlc::{TlcRequest, TlcResponse};

/// Current wire format version. Bumped whenever a breaking change is made
/// to the envelope or any message payload.
pub const PROTOCOL_VERSION: u8 = 1;

/// Rejects an envelope from a peer speaking an incompatible protocol
/// version before its body is ever deserialized.
pub fn check_version(envelope_version: u8) -> Result<(), PhobosError> {
    if envelope_version != PROTOCOL_VERSION {
        return Err(PhobosError::Protocol(format!("unsupported protocol version {envelope_version} (expected {PROTOCOL_VERSION})")));
    }
    Ok(())
}

/// Maximum accepted frame size. A frame larger than this is a protocol
/// error (most likely a corrupted length prefix), never a legitimate
/// request.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A framed envelope around a JSON-encoded message body. `id` lets clients
/// correlate responses to requests; `version` lets either end
/// reject a peer running an incompatible protocol before attempting to
/// decode the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u8,
    pub id: RequestId,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(id: RequestId, body: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            body,
        }
    }
}

/// Errors reported over the wire, always as a negated
/// POSIX errno plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (rc={rc})")]
pub struct WireError {
    pub rc: i32,
    /// `Display` of the originating request kind (an LRS [`phobos_api_types::RequestKind`]
    /// or a TLC verb name) -- kept as a string since the two request kinds
    /// don't share a type and a wire error can originate from either.
    pub req_kind: String,
    pub message: String,
    /// Structured diagnostic payload (e.g. `{"drive_serial_unknown": "X"}`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<serde_json::Value>,
}

impl WireError {
    /// Build a `WireError` from the shared [`PhobosError`] taxonomy:
    /// `rc` and `message` come straight from it, `diagnostic` carries its
    /// machine-readable code so clients can match on it without parsing text.
    pub fn from_phobos(req_kind: impl Into<String>, err: &PhobosError) -> Self {
        WireError {
            rc: err.rc(),
            req_kind: req_kind.into(),
            message: err.to_string(),
            diagnostic: Some(serde_json::json!({ "code": err.code() })),
        }
    }
}

/// Length-delimited JSON codec: a 4-byte big-endian length prefix followed
/// by that many bytes of JSON. Encoder/Decoder are implemented directly
/// (rather than wrapping `LengthDelimitedCodec`) so the length check and
/// the JSON decode share one error type.
pub struct JsonFrameCodec<T> {
    _marker: std::marker::PhantomData<T>,
}

impl<T> Default for JsonFrameCodec<T> {
    fn default() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonFrameCodec<T> {
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > MAX_FRAME_SIZE {
            bail!("outgoing frame too large: {} bytes", payload.len());
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl<T: for<'de> Deserialize<'de>> Decoder for JsonFrameCodec<T> {
    type Item = T;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_SIZE {
            bail!("incoming frame too large: {len} bytes");
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let payload: Bytes = src.split_to(len).freeze();
        let item = serde_json::from_slice(&payload)?;
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lrs::{LrsRequest, LrsResponse, NotifyOp, ReadOperation};
    use crate::tlc::{TlcRequest, TlcResponse};
    use phobos_api_types::{AddressingScheme, FsType, ResourceFamily};

    fn round_trip<T>(value: T)
    where
        T: Serialize + for<'de> Deserialize<'de> + PartialEq + std::fmt::Debug,
    {
        let json = serde_json::to_string(&value).unwrap();
        let back: T = serde_json::from_str(&json).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn check_version_rejects_anything_but_the_current_version() {
        assert!(check_version(PROTOCOL_VERSION).is_ok());
        let err = check_version(PROTOCOL_VERSION + 1).unwrap_err();
        assert!(matches!(err, phobos_api_types::PhobosError::Protocol(_)));
    }

    #[test]
    fn lrs_request_round_trips() {
        round_trip(LrsRequest::Ping);
        round_trip(LrsRequest::Read { required_media: vec!["VOL0001".to_string()], operation: ReadOperation::Read });
        round_trip(LrsRequest::Write { size: 4096, tags: vec!["a".to_string()], family: ResourceFamily::Tape, copy_name: None });
        round_trip(LrsRequest::Notify { op: NotifyOp::DeviceLock, rsrc_id: "HU0001".to_string(), wait: Some(true) });
    }

    #[test]
    fn lrs_response_round_trips() {
        round_trip(LrsResponse::PingResp);
        round_trip(LrsResponse::WriteResp {
            drive: "HU0001".to_string(),
            medium: "VOL0001".to_string(),
            root_path: "/mnt/phobos/HU0001".to_string(),
            fs_type: FsType::Ltfs,
            addr_type: AddressingScheme::Hash1,
        });
        round_trip(LrsResponse::Error(WireError {
            rc: -5,
            req_kind: "write".to_string(),
            message: "no free slot".to_string(),
            diagnostic: Some(serde_json::json!({"code": "no_free_slot"})),
        }));
    }

    #[test]
    fn tlc_request_and_response_round_trip() {
        round_trip(TlcRequest::Load { drive_serial: "HU0001".to_string(), tape_label: "VOL0001".to_string() });
        round_trip(TlcResponse::LoadResp { drive_address: 0x3000, slot_address: 0x1004 });
    }

    #[test]
    fn envelope_round_trips_through_the_frame_codec() {
        let mut codec = JsonFrameCodec::<Envelope<LrsRequest>>::default();
        let sent = Envelope::new(7, LrsRequest::Ping);

        let mut buf = BytesMut::new();
        codec.encode(sent.clone(), &mut buf).unwrap();

        let mut decoder = JsonFrameCodec::<Envelope<LrsRequest>>::default();
        let received = decoder.decode(&mut buf).unwrap().expect("one complete frame");
        assert_eq!(sent, received);
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_waits_for_a_full_frame_before_producing_one() {
        let mut codec = JsonFrameCodec::<Envelope<TlcResponse>>::default();
        let mut buf = BytesMut::new();
        codec.encode(Envelope::new(1, TlcResponse::RefreshResp), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        let mut decoder = JsonFrameCodec::<Envelope<TlcResponse>>::default();
        assert!(decoder.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert!(decoder.decode(&mut partial).unwrap().is_some());
    }
}
