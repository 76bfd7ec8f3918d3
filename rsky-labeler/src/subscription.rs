//! `com.atproto.label.subscribeLabels` event-stream frames.
//!
//! A frame is two concatenated DAG-CBOR values: a header and a body. Message
//! headers carry `op: 1` and the body type in `t`; error headers carry only
//! `op: -1`.

use crate::label::{CodecError, SignedLabel};
use crate::store::StoredLabel;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

pub const LABELS_TYPE: &str = "#labels";
pub const FUTURE_CURSOR: &str = "FutureCursor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(i8)]
pub enum FrameType {
    Message = 1,
    Error = -1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFrameHeader {
    pub t: String,
    pub op: FrameType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrameHeader {
    pub op: FrameType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelsBody {
    pub seq: i64,
    pub labels: Vec<SignedLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrameBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFrame {
    Labels {
        header: MessageFrameHeader,
        body: LabelsBody,
    },
    Error {
        header: ErrorFrameHeader,
        body: ErrorFrameBody,
    },
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

impl SubscriptionFrame {
    pub fn labels(seq: i64, labels: Vec<SignedLabel>) -> Self {
        Self::Labels {
            header: MessageFrameHeader {
                t: LABELS_TYPE.to_string(),
                op: FrameType::Message,
            },
            body: LabelsBody { seq, labels },
        }
    }

    pub fn error(error: &str, message: Option<String>) -> Self {
        Self::Error {
            header: ErrorFrameHeader {
                op: FrameType::Error,
            },
            body: ErrorFrameBody {
                error: error.to_string(),
                message,
            },
        }
    }

    pub fn future_cursor() -> Self {
        Self::error(FUTURE_CURSOR, Some("Cursor in the future.".to_string()))
    }

    pub fn op(&self) -> FrameType {
        match self {
            Self::Labels { header, .. } => header.op,
            Self::Error { header, .. } => header.op,
        }
    }

    pub fn is_error(&self) -> bool {
        self.op() == FrameType::Error
    }

    /// Sequence number of a labels frame.
    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Labels { body, .. } => Some(body.seq),
            Self::Error { .. } => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(match self {
            Self::Labels { header, body } => [to_cbor(header)?, to_cbor(body)?].concat(),
            Self::Error { header, body } => [to_cbor(header)?, to_cbor(body)?].concat(),
        })
    }
}

/// One `#labels` frame per stored label, `seq` set to the label's identity.
pub fn labels_frames(stored: Vec<StoredLabel>) -> Vec<SubscriptionFrame> {
    stored
        .into_iter()
        .map(|StoredLabel { id, label }| SubscriptionFrame::labels(id, vec![label]))
        .collect()
}
