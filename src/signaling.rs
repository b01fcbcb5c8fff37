//! Signaling envelopes carried on the Zork control channel.
//!
//! Two wire shapes exist. Modern peers send a bare SDP object
//! (`{"type":"offer","sdp":…}`) or a candidate container
//! (`{"candidate":…}`). Legacy peers wrap everything in
//! `{"signals":{"PLAIN":[…]}}` with a numeric tag on the inner message.
//! Both are parsed here into one typed union so the session never touches
//! raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// An SDP description as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// An ICE candidate in browser JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// One inbound signaling message, envelope already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalIn {
    Offer(SdpPayload),
    Answer(SdpPayload),
    Candidate(CandidatePayload),
}

/// Parse result for one signaling line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub signal: SignalIn,
    /// True when the line used the legacy envelope.
    pub legacy: bool,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("legacy envelope carries {0} messages, expected exactly one")]
    MultiMessage(usize),
    #[error("unsupported signals channel {0:?}, only PLAIN is understood")]
    UnsupportedChannel(String),
    #[error("legacy envelope is malformed")]
    MalformedEnvelope,
}

impl SignalError {
    /// Fatal errors leave the session incoherent and abort it; the rest are
    /// logged and the line is skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SignalError::MultiMessage(_) | SignalError::UnsupportedChannel(_)
        )
    }
}

// Legacy inner-message tags.
const LEGACY_OFFER: u64 = 0;
const LEGACY_ANSWER: u64 = 1;
const LEGACY_CANDIDATE: u64 = 2;

/// Parses one signaling line. `Ok(None)` means a shape we recognize well
/// enough to know it is not for us; the caller logs and moves on.
pub fn parse_line(line: &str) -> Result<Option<Parsed>, SignalError> {
    let value: Value = serde_json::from_str(line)?;
    let Some(object) = value.as_object() else {
        return Ok(None);
    };

    if let Some(signals) = object.get("signals") {
        return Ok(parse_legacy(signals)?.map(|signal| Parsed {
            signal,
            legacy: true,
        }));
    }

    if object.contains_key("type") && object.contains_key("sdp") {
        let sdp: SdpPayload = serde_json::from_value(value.clone())?;
        return Ok(match sdp.kind.as_str() {
            "offer" => Some(Parsed {
                signal: SignalIn::Offer(sdp),
                legacy: false,
            }),
            "answer" => Some(Parsed {
                signal: SignalIn::Answer(sdp),
                legacy: false,
            }),
            _ => None,
        });
    }

    if let Some(candidate) = object.get("candidate") {
        return Ok(Some(Parsed {
            signal: SignalIn::Candidate(candidate_payload(candidate)?),
            legacy: false,
        }));
    }

    Ok(None)
}

fn parse_legacy(signals: &Value) -> Result<Option<SignalIn>, SignalError> {
    let Some(channels) = signals.as_object() else {
        return Err(SignalError::MalformedEnvelope);
    };
    for channel in channels.keys() {
        if channel != "PLAIN" {
            return Err(SignalError::UnsupportedChannel(channel.clone()));
        }
    }
    let Some(plain) = channels.get("PLAIN").and_then(Value::as_array) else {
        return Err(SignalError::MalformedEnvelope);
    };
    if plain.len() != 1 {
        return Err(SignalError::MultiMessage(plain.len()));
    }
    let inner = &plain[0];

    match inner.get("type").and_then(Value::as_u64) {
        Some(LEGACY_OFFER) => {
            let description = inner
                .get("description")
                .ok_or(SignalError::MalformedEnvelope)?;
            let sdp: SdpPayload = serde_json::from_value(description.clone())?;
            Ok(Some(SignalIn::Offer(sdp)))
        }
        Some(LEGACY_CANDIDATE) => {
            let candidate = inner
                .get("candidate")
                .ok_or(SignalError::MalformedEnvelope)?;
            Ok(Some(SignalIn::Candidate(candidate_payload(candidate)?)))
        }
        _ => Ok(None),
    }
}

fn candidate_payload(value: &Value) -> Result<CandidatePayload, SignalError> {
    match value {
        Value::String(candidate) => Ok(CandidatePayload {
            candidate: candidate.clone(),
            ..CandidatePayload::default()
        }),
        other => Ok(serde_json::from_value(other.clone())?),
    }
}

pub fn encode_offer(offer: &SdpPayload) -> String {
    json!({ "type": offer.kind, "sdp": offer.sdp }).to_string()
}

pub fn encode_answer(answer: &SdpPayload, legacy: bool) -> String {
    if legacy {
        json!({
            "signals": {
                "PLAIN": [{
                    "type": LEGACY_ANSWER,
                    "description": { "type": answer.kind, "sdp": answer.sdp },
                }]
            }
        })
        .to_string()
    } else {
        json!({ "type": answer.kind, "sdp": answer.sdp }).to_string()
    }
}

pub fn encode_candidate(candidate: &CandidatePayload, legacy: bool) -> String {
    let payload = serde_json::to_value(candidate).unwrap_or_default();
    if legacy {
        json!({
            "signals": { "PLAIN": [{ "type": LEGACY_CANDIDATE, "candidate": payload }] }
        })
        .to_string()
    } else {
        json!({ "candidate": payload }).to_string()
    }
}
