use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Minimum receive buffer the contract guarantees.
pub const RECV_BUFFER_BYTES: usize = 4096;

/// Hard cap on a single frame; anything larger is a corrupt or hostile peer.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Operations the embedding service understands. One request per
/// connection; anything after the first message is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Embed,
    Health,
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub op: Op,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            status: Status::Ok,
            payload,
            error: None,
        }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            payload: serde_json::Value::Null,
            error: Some(WireError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbedPayload {
    pub texts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbedReply {
    pub dim: usize,
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReply {
    pub model: String,
    pub dim: usize,
    pub fingerprint: String,
    pub pid: u32,
}

/// Length-prefixed framing: 4-byte little-endian length, then a JSON body.
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> io::Result<()> {
    let body = serde_json::to_vec(msg).map_err(io::Error::other)?;
    let len = u32::try_from(body.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length")
    })?;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {len} bytes exceeds cap"),
        ));
    }
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()
}

pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("refusing frame of {len} bytes"),
        ));
    }

    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad frame body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_round_trip() {
        let req = Request {
            op: Op::Embed,
            payload: serde_json::to_value(EmbedPayload {
                texts: vec!["fn main() {}".into()],
            })
            .unwrap(),
        };

        let mut wire = Vec::new();
        write_frame(&mut wire, &req).unwrap();
        assert_eq!(u32::from_le_bytes(wire[..4].try_into().unwrap()) as usize, wire.len() - 4);

        let back: Request = read_frame(&mut Cursor::new(&wire)).unwrap();
        assert_eq!(back.op, Op::Embed);
        let payload: EmbedPayload = serde_json::from_value(back.payload).unwrap();
        assert_eq!(payload.texts, vec!["fn main() {}".to_string()]);
    }

    #[test]
    fn oversized_length_prefix_is_refused() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_le_bytes());
        wire.extend_from_slice(b"junk");
        let err = read_frame::<_, Request>(&mut Cursor::new(&wire)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_an_error_not_a_hang() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&100u32.to_le_bytes());
        wire.extend_from_slice(b"short");
        assert!(read_frame::<_, Request>(&mut Cursor::new(&wire)).is_err());
    }

    #[test]
    fn error_responses_carry_code_and_message() {
        let resp = Response::err("embedder_failure", "model exploded");
        let mut wire = Vec::new();
        write_frame(&mut wire, &resp).unwrap();
        let back: Response = read_frame(&mut Cursor::new(&wire)).unwrap();
        assert_eq!(back.status, Status::Error);
        let err = back.error.unwrap();
        assert_eq!(err.code, "embedder_failure");
        assert_eq!(err.message, "model exploded");
    }
}
