//! Label records and their canonical encodings.
//!
//! The bytes that get signed are the DAG-CBOR encoding of [`UnsignedLabel`].
//! DAG-CBOR orders map keys by length and then bytewise; every label key is
//! three bytes long, so the canonical order is plain alphabetical and the
//! structs below declare their fields in exactly that order. Absent optional
//! fields are never emitted, `neg` is always emitted and `ver` is always 1:
//! changing any of this changes every signature.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

/// The only label schema version this service produces or accepts.
pub const LABEL_VERSION: i64 = 1;

pub const RFC3339_VARIANT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

// Accepts `$bytes` values with or without trailing padding.
const SIG_DECODER: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to encode label: {0}")]
    Encode(String),
    #[error("invalid label signature: {0}")]
    InvalidSignature(String),
    #[error("malformed label: {0}")]
    Malformed(String),
}

/// Caller-supplied label fields, before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<i64>,
    pub val: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neg: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
}

/// The canonical pre-signature record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedLabel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub cts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default)]
    pub neg: bool,
    pub src: String,
    pub uri: String,
    pub val: String,
    #[serde(default = "label_version")]
    pub ver: i64,
}

/// An [`UnsignedLabel`] plus the raw signature over its canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLabel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub cts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default)]
    pub neg: bool,
    #[serde(with = "serde_bytes")]
    pub sig: Vec<u8>,
    pub src: String,
    pub uri: String,
    pub val: String,
    #[serde(default = "label_version")]
    pub ver: i64,
}

fn label_version() -> i64 {
    LABEL_VERSION
}

impl UnsignedLabel {
    pub fn into_signed(self, sig: Vec<u8>) -> SignedLabel {
        SignedLabel {
            cid: self.cid,
            cts: self.cts,
            exp: self.exp,
            neg: self.neg,
            sig,
            src: self.src,
            uri: self.uri,
            val: self.val,
            ver: self.ver,
        }
    }
}

impl SignedLabel {
    /// The record the signature was computed over.
    pub fn unsigned(&self) -> UnsignedLabel {
        UnsignedLabel {
            cid: self.cid.clone(),
            cts: self.cts.clone(),
            exp: self.exp.clone(),
            neg: self.neg,
            src: self.src.clone(),
            uri: self.uri.clone(),
            val: self.val.clone(),
            ver: self.ver,
        }
    }
}

/// Current time in the millisecond-precision UTC form used for `cts`.
pub fn now_timestamp() -> String {
    Utc::now().format(RFC3339_VARIANT).to_string()
}

/// Builds the canonical unsigned record: `ver` forced to 1, `neg` forced to a
/// boolean, `src` defaulted to `default_src` and `cts` to the current time.
pub fn build_canonical_unsigned(data: LabelData, default_src: &str) -> UnsignedLabel {
    UnsignedLabel {
        cid: data.cid,
        cts: data.cts.unwrap_or_else(now_timestamp),
        exp: data.exp,
        neg: data.neg.unwrap_or(false),
        src: data.src.unwrap_or_else(|| default_src.to_string()),
        uri: data.uri,
        val: data.val,
        ver: LABEL_VERSION,
    }
}

/// The byte sequence a label signature is computed over.
pub fn encode_for_signing(label: &UnsignedLabel) -> Result<Vec<u8>, CodecError> {
    serde_ipld_dagcbor::to_vec(label).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Byte string wrapper used by atproto JSON: `{"$bytes": "<base64>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBytes {
    #[serde(rename = "$bytes")]
    pub bytes: String,
}

/// JSON shape served to label consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedLabel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub cts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default)]
    pub neg: bool,
    pub sig: WireBytes,
    pub src: String,
    pub uri: String,
    pub val: String,
    #[serde(default = "label_version")]
    pub ver: i64,
}

pub fn format_label(label: &SignedLabel) -> FormattedLabel {
    FormattedLabel {
        cid: label.cid.clone(),
        cts: label.cts.clone(),
        exp: label.exp.clone(),
        neg: label.neg,
        sig: WireBytes {
            bytes: STANDARD.encode(&label.sig),
        },
        src: label.src.clone(),
        uri: label.uri.clone(),
        val: label.val.clone(),
        ver: label.ver,
    }
}

impl FormattedLabel {
    pub fn into_signed(self) -> Result<SignedLabel, CodecError> {
        let sig = SIG_DECODER
            .decode(self.sig.bytes.as_bytes())
            .map_err(|e| CodecError::InvalidSignature(format!("sig is not valid base64: {e}")))?;
        Ok(SignedLabel {
            cid: self.cid,
            cts: self.cts,
            exp: self.exp,
            neg: self.neg,
            sig,
            src: self.src,
            uri: self.uri,
            val: self.val,
            ver: self.ver,
        })
    }
}

/// Formats an untyped JSON label for the wire. A `sig` given as an array of
/// byte values is wrapped as `{"$bytes": ...}`; an already wrapped `sig` is
/// kept; any other `sig` shape is an error.
pub fn format_label_json(mut label: JsonValue) -> Result<JsonValue, CodecError> {
    let obj = label
        .as_object_mut()
        .ok_or_else(|| CodecError::Malformed("label must be a JSON object".into()))?;

    let wrapped = match obj.get("sig") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::Array(items)) => {
            let bytes = items
                .iter()
                .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| {
                    CodecError::InvalidSignature("sig array must contain only byte values".into())
                })?;
            Some(json!({ "$bytes": STANDARD.encode(bytes) }))
        }
        Some(JsonValue::Object(map)) => match (map.len(), map.get("$bytes")) {
            (1, Some(JsonValue::String(encoded))) => {
                SIG_DECODER.decode(encoded.as_bytes()).map_err(|e| {
                    CodecError::InvalidSignature(format!("sig is not valid base64: {e}"))
                })?;
                None
            }
            _ => {
                return Err(CodecError::InvalidSignature(
                    "sig object must have exactly one \"$bytes\" string field".into(),
                ))
            }
        },
        Some(other) => {
            return Err(CodecError::InvalidSignature(format!(
                "expected raw bytes or {{\"$bytes\": ...}}, got {other}"
            )))
        }
    };

    if let Some(wrapped) = wrapped {
        obj.insert("sig".to_string(), wrapped);
    }
    Ok(label)
}

/// True iff the label carries a non-null `sig` property.
pub fn is_signed(label: &JsonValue) -> bool {
    label.get("sig").is_some_and(|sig| !sig.is_null())
}
