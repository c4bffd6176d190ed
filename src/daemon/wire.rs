//! Wire protocol: per-connection framing and the two encodings.
//!
//! A connection starts in dumper mode (`<cmd> <hex>\n` per request). A line
//! matching `json <len>` switches it permanently to JSON mode, where each
//! request is a length-prefixed JSON object `{"cmd": ..., "params": {...}}`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::dumper;
use super::ops::OpError;
use crate::error::Transience;

/// Request parameters as received off the wire.
pub type Params = serde_json::Map<String, Value>;

/// Upper bound on a single request frame.
const MAX_REQUEST_BYTES: usize = 1 << 20;

// =============================================================================
// Response
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
}

/// The single response shape every request gets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub message: String,
    pub data: Value,
    /// Retry hint; meaningful only for errors. Legacy clients expect 0/1.
    #[serde(with = "int_bool")]
    pub temporary: bool,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self::success_with(message, Value::Null)
    }

    pub fn success_with(message: impl Into<String>, data: Value) -> Self {
        Response {
            kind: ResponseKind::Success,
            message: message.into(),
            data,
            temporary: false,
        }
    }

    pub fn err(e: &OpError) -> Self {
        Response {
            kind: ResponseKind::Error,
            message: e.to_string(),
            data: Value::Null,
            temporary: e.transience() == Transience::Retryable,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Response {
            kind: ResponseKind::Error,
            message: message.into(),
            data: Value::Null,
            temporary: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ResponseKind::Success
    }
}

/// Legacy clients encode booleans as 0/1 integers.
mod int_bool {
    use serde::de::{Deserializer, Error};
    use serde::ser::Serializer;
    use serde::Deserialize;

    pub fn serialize<S: Serializer>(value: &bool, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
        match serde_json::Value::deserialize(de)? {
            serde_json::Value::Bool(b) => Ok(b),
            serde_json::Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
            other => Err(D::Error::custom(format!("expected 0/1, got {other}"))),
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

#[derive(Error, Debug)]
pub enum WireError {
    /// JSON-mode payload that does not parse; the client gets an error
    /// response.
    #[error("unparseable JSON request: {0}")]
    BadJson(String),

    /// Dumper-mode frame outside the compatibility whitelist; logged and
    /// dropped without a response.
    #[error("undecodable dumper request: {0}")]
    Dumper(String),

    /// Frame exceeds the request size bound; the connection is closed.
    #[error("request exceeds {MAX_REQUEST_BYTES} bytes")]
    TooLarge,
}

/// A parsed request: command token plus parameter map.
#[derive(Debug)]
pub struct RawRequest {
    pub cmd: String,
    pub params: Params,
}

#[derive(Deserialize)]
struct JsonRequest {
    cmd: String,
    params: Params,
}

fn json_header(line: &str) -> Option<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let caps = RE
        .get_or_init(|| Regex::new(r"^json\s*(\d+)$").expect("static regex"))
        .captures(line)?;
    caps.get(1)?.as_str().parse().ok()
}

/// Per-connection codec state.
#[derive(Debug, Default)]
pub struct ConnState {
    recv_buf: Vec<u8>,
    pending_json_bytes: usize,
    json_mode: bool,
}

impl ConnState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Once a connection has spoken JSON, responses stay JSON.
    pub fn json_mode(&self) -> bool {
        self.json_mode
    }

    /// Append bytes read off the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.recv_buf.extend_from_slice(bytes);
    }

    /// Extract the next complete request, if the buffer holds one.
    pub fn next_request(&mut self) -> Option<Result<RawRequest, WireError>> {
        loop {
            if self.pending_json_bytes > 0 {
                if self.recv_buf.len() < self.pending_json_bytes {
                    return None;
                }
                let payload: Vec<u8> = self.recv_buf.drain(..self.pending_json_bytes).collect();
                self.pending_json_bytes = 0;
                return Some(parse_json_payload(&payload));
            }

            let newline = match self.recv_buf.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None if self.recv_buf.len() > MAX_REQUEST_BYTES => {
                    return Some(Err(WireError::TooLarge));
                }
                None => return None,
            };
            let line: Vec<u8> = self.recv_buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..newline]);
            let line = line.trim_end_matches('\r');

            if line.trim().is_empty() {
                continue;
            }

            if let Some(len) = json_header(line.trim()) {
                if len > MAX_REQUEST_BYTES {
                    return Some(Err(WireError::TooLarge));
                }
                self.json_mode = true;
                self.pending_json_bytes = len;
                continue;
            }

            if self.json_mode {
                // A bare line after the switch is a framing error.
                return Some(Err(WireError::BadJson(format!(
                    "expected json length header, got {line:?}"
                ))));
            }

            return Some(parse_dumper_line(line));
        }
    }
}

fn parse_json_payload(payload: &[u8]) -> Result<RawRequest, WireError> {
    let req: JsonRequest =
        serde_json::from_slice(payload).map_err(|e| WireError::BadJson(e.to_string()))?;
    Ok(RawRequest {
        cmd: req.cmd,
        params: req.params,
    })
}

fn parse_dumper_line(line: &str) -> Result<RawRequest, WireError> {
    let (cmd, body) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| WireError::Dumper(format!("no body in {line:?}")))?;
    let bytes =
        hex::decode(body.trim()).map_err(|e| WireError::Dumper(format!("bad hex: {e}")))?;
    let text =
        String::from_utf8(bytes).map_err(|e| WireError::Dumper(format!("bad utf8: {e}")))?;
    let params = dumper::decode_params(&text).map_err(|e| WireError::Dumper(e.to_string()))?;
    Ok(RawRequest {
        cmd: cmd.to_string(),
        params,
    })
}

// =============================================================================
// Response encoding
// =============================================================================

/// Encode a response in the connection's current mode.
///
/// JSON mode: `<cmd> <len>\n<json>`, no trailer. Dumper mode:
/// `<cmd> <hex>\nDONE\n`.
pub fn encode_response(cmd: &str, resp: &Response, json_mode: bool) -> Vec<u8> {
    let value = serde_json::to_value(resp).unwrap_or_else(|_| {
        serde_json::json!({
            "type": "ERROR",
            "message": "response encoding failed",
            "data": null,
            "temporary": 0,
        })
    });
    if json_mode {
        let body = value.to_string().into_bytes();
        let mut out = format!("{cmd} {}\n", body.len()).into_bytes();
        out.extend_from_slice(&body);
        out
    } else {
        let body = hex::encode(dumper::encode_value(&value));
        format!("{cmd} {body}\nDONE\n").into_bytes()
    }
}
