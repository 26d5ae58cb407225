//! Wire protocol for the client <-> gateway socket (spec.md §4.5).
//!
//! Keeps the teacher's binary envelope idiom (bincode, gzip above 1 KiB,
//! a leading compression-flag byte) but carries the gateway's actual
//! typed event surface instead of the teacher's fixed terminal/resize/
//! ping set.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

const COMPRESS_THRESHOLD: usize = 1024;

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, EncodeError> {
    let serialized = bincode::serialize(msg).map_err(|e| EncodeError(e.to_string()))?;

    if serialized.len() > COMPRESS_THRESHOLD {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&serialized).map_err(|e| EncodeError(e.to_string()))?;
        let compressed = encoder.finish().map_err(|e| EncodeError(e.to_string()))?;
        if compressed.len() < serialized.len() {
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(1u8);
            out.extend_from_slice(&compressed);
            return Ok(out);
        }
    }

    let mut out = Vec::with_capacity(serialized.len() + 1);
    out.push(0u8);
    out.extend_from_slice(&serialized);
    Ok(out)
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, EncodeError> {
    let Some((&flag, payload)) = data.split_first() else {
        return Err(EncodeError("empty frame".into()));
    };
    let serialized = if flag == 1 {
        let mut decoder = GzDecoder::new(payload);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|e| EncodeError(e.to_string()))?;
        out
    } else {
        payload.to_vec()
    };
    bincode::deserialize(&serialized).map_err(|e| EncodeError(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct EncodeError(pub String);

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "protocol error: {}", self.0)
    }
}
impl std::error::Error for EncodeError {}

/// `authenticate` payload (spec.md §4.5 inbound table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatePayload {
    pub username: String,
    pub host: Option<String>,
    pub port: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalPayload {
    pub term: Option<String>,
    pub rows: Option<u32>,
    pub cols: Option<u32>,
    pub env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizePayload {
    pub rows: u32,
    pub cols: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPayload {
    pub command: String,
    pub pty: Option<bool>,
    pub term: Option<String>,
    pub rows: Option<u32>,
    pub cols: Option<u32>,
    pub env: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlAction {
    Reauth,
    ClearCredentials,
    ReplayCredentials,
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResponsePayload {
    pub id: String,
    pub action: String,
    pub inputs: Option<Vec<String>>,
}

/// Events the client sends to the gateway (spec.md §4.5 "inbound").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientEvent {
    Authenticate(AuthenticatePayload),
    Terminal(TerminalPayload),
    Resize(ResizePayload),
    Data(Vec<u8>),
    Exec(ExecPayload),
    Control(ControlAction),
    PromptResponse(PromptResponsePayload),
}

impl ClientEvent {
    pub fn to_binary(&self) -> Result<Vec<u8>, EncodeError> {
        encode(self)
    }
    pub fn from_binary(data: &[u8]) -> Result<Self, EncodeError> {
        decode(data)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecStreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecDataPayload {
    pub kind: ExecStreamKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecExitPayload {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResultPayload {
    pub success: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPayload {
    pub id: String,
    pub prompt_type: String,
    pub title: String,
    pub buttons: Vec<String>,
    pub inputs: Option<Vec<String>>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub event: String,
    pub reason: String,
}

/// Events the gateway sends to the client (spec.md §4.5 "outbound"), plus
/// the `v1:error` envelope for malformed inbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    AuthResult(AuthResultPayload),
    Prompt(PromptPayload),
    SshData(Vec<u8>),
    ExecData(ExecDataPayload),
    ExecExit(ExecExitPayload),
    Title(String),
    Disconnect(DisconnectPayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn to_binary(&self) -> Result<Vec<u8>, EncodeError> {
        encode(self)
    }
    pub fn from_binary(data: &[u8]) -> Result<Self, EncodeError> {
        decode(data)
    }

    pub fn ssh_data(data: Bytes) -> Self {
        ServerEvent::SshData(data.to_vec())
    }

    pub fn error(event: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            event: event.into(),
            reason: reason.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_round_trips_small_payload() {
        let event = ClientEvent::Resize(ResizePayload { rows: 24, cols: 80 });
        let binary = event.to_binary().unwrap();
        assert_eq!(binary[0], 0, "small payloads stay uncompressed");
        let decoded = ClientEvent::from_binary(&binary).unwrap();
        match decoded {
            ClientEvent::Resize(p) => assert_eq!((p.rows, p.cols), (24, 80)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_event_compresses_large_payload() {
        let event = ServerEvent::SshData(vec![b'A'; 4096]);
        let binary = event.to_binary().unwrap();
        assert_eq!(binary[0], 1, "large repetitive payloads compress smaller");
        let decoded = ServerEvent::from_binary(&binary).unwrap();
        match decoded {
            ServerEvent::SshData(data) => assert_eq!(data.len(), 4096),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decode_rejects_empty_frame() {
        assert!(ClientEvent::from_binary(&[]).is_err());
    }

    #[test]
    fn error_event_constructor() {
        let event = ServerEvent::error("data", "malformed payload");
        match event {
            ServerEvent::Error(p) => {
                assert_eq!(p.event, "data");
                assert_eq!(p.reason, "malformed payload");
            }
            _ => panic!("wrong variant"),
        }
    }
}
