//! Handshake Wire Protocol
//!
//! Single responsibility: encode and decode the JSON text frames of the
//! challenge-response handshake.
//!
//! # Wire Format
//!
//! ```text
//! server → client   {"type":"CHALLENGE","data":{"payload":"<base64>"}}
//! client → server   {"type":"CHALLENGE_RESPONSE","data":{"payload":"<base64>","signature":"<base64>"}}
//! server → client   {"type":"AUTHORIZED"}
//! ```
//!
//! Any `type` other than `AUTHORIZED` in the third frame is a rejection.
//! After that, frames are opaque to this crate.

use serde::Serialize;
use serde_json::Value;

use crate::error::SessionError;
use crate::identity::{decode_base64, encode_base64, Identity};

/// A decoded `CHALLENGE` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// The base64 payload exactly as the server sent it
    pub payload: String,
    /// Decoded nonce bytes to sign
    pub nonce: Vec<u8>,
}

/// Frames the client sends during the handshake.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    ChallengeResponse { payload: String, signature: String },
}

/// Decode the first frame. Anything but a well-formed challenge is
/// `BadChallengeRequest`.
pub fn decode_challenge(text: Option<&str>) -> Result<Challenge, SessionError> {
    let value: Value = text
        .and_then(|t| serde_json::from_str(t).ok())
        .ok_or(SessionError::BadChallengeRequest)?;

    if value.get("type").and_then(Value::as_str) != Some("CHALLENGE") {
        return Err(SessionError::BadChallengeRequest);
    }

    let payload = value
        .get("data")
        .and_then(|data| data.get("payload"))
        .and_then(Value::as_str)
        .ok_or(SessionError::BadChallengeRequest)?;

    let nonce = decode_base64(payload)?;

    Ok(Challenge {
        payload: payload.to_string(),
        nonce,
    })
}

/// Sign a challenge and encode the `CHALLENGE_RESPONSE` frame.
pub fn encode_challenge_response(
    challenge: &Challenge,
    identity: &dyn Identity,
) -> Result<String, SessionError> {
    let signature = identity.sign(&challenge.nonce);
    let message = ClientMessage::ChallengeResponse {
        payload: challenge.payload.clone(),
        signature: encode_base64(&signature),
    };
    serde_json::to_string(&message).map_err(|e| {
        SessionError::connection(format!("Failed to encode challenge response: {}", e))
    })
}

/// Decode the second frame. Anything but `AUTHORIZED` is a
/// `BadAuthorizationResponse` carrying the decoded body. A frame that is not
/// JSON at all is carried as a JSON string.
pub fn decode_authorization(text: Option<&str>) -> Result<(), SessionError> {
    let body = match text {
        Some(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        None => Value::Null,
    };

    if body.get("type").and_then(Value::as_str) == Some("AUTHORIZED") {
        Ok(())
    } else {
        Err(SessionError::BadAuthorizationResponse { body })
    }
}
