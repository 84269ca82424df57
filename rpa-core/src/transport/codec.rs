use super::envelope::{Envelope, MessageType};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Payload encoding negotiated at `HELLO`, §6. Everything before that
/// negotiation (the `HELLO`/`WELCOME` pair itself) is always MessagePack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    #[default]
    MessagePack,
    Json,
}

/// Frame body once `type` has been pulled out into its own wire field.
#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeBody {
    msg_id: u128,
    corr_id: Option<u128>,
    ts: u64,
    payload: serde_json::Value,
}

/// Length-prefixed binary framing for `Envelope`s, §4.3/§6: a little-endian
/// `u32` length, then a `u16` type code, then a MessagePack- or
/// JSON-encoded body, with the format chosen per-session at `HELLO`.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    format: PayloadFormat,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_format(&mut self, format: PayloadFormat) {
        self.format = format;
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let code = item.kind.code();
        let body = EnvelopeBody {
            msg_id: item.msg_id,
            corr_id: item.corr_id,
            ts: item.ts,
            payload: item.payload,
        };
        let body_bytes = match self.format {
            PayloadFormat::MessagePack => rmp_serde::to_vec(&body)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            PayloadFormat::Json => serde_json::to_vec(&body)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        };
        dst.put_u32_le((2 + body_bytes.len()) as u32);
        dst.put_u16_le(code);
        dst.extend_from_slice(&body_bytes);
        Ok(())
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(src[..4].try_into().unwrap()) as usize;
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        if len < 2 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame shorter than the type field",
            ));
        }
        src.advance(4);
        let mut frame = src.split_to(len);
        let code = u16::from_le_bytes(frame[..2].try_into().unwrap());
        frame.advance(2);
        let body: EnvelopeBody = match self.format {
            PayloadFormat::MessagePack => rmp_serde::from_slice(&frame)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            PayloadFormat::Json => serde_json::from_slice(&frame)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        };
        Ok(Some(Envelope {
            msg_id: body.msg_id,
            corr_id: body.corr_id,
            kind: MessageType::from_code(code),
            ts: body.ts,
            payload: body.payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::envelope::MessageType;

    #[test]
    fn encode_then_decode_recovers_the_envelope() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        let env = Envelope::new(7, MessageType::Ping, serde_json::json!(null));
        codec.encode(env.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_id, env.msg_id);
        assert_eq!(decoded.kind, MessageType::Ping);
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut codec = EnvelopeCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                Envelope::new(1, MessageType::Ping, serde_json::json!(null)),
                &mut full,
            )
            .unwrap();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn json_format_round_trips_once_negotiated() {
        let mut codec = EnvelopeCodec::new();
        codec.set_format(PayloadFormat::Json);
        let mut buf = BytesMut::new();
        let env = Envelope::new(3, MessageType::Assign, serde_json::json!({"job_id": "abc"}));
        codec.encode(env, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, MessageType::Assign);
        assert_eq!(decoded.payload, serde_json::json!({"job_id": "abc"}));
    }

    #[test]
    fn unknown_type_code_decodes_to_unknown_variant() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::new(1, MessageType::Ping, serde_json::json!(null)), &mut buf)
            .unwrap();
        // overwrite the type field (bytes 4..6) with a code nothing maps to
        buf[4] = 0xEE;
        buf[5] = 0xEE;
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded.kind, MessageType::Unknown(_)));
    }
}
