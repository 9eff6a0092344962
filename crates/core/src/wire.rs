use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::{Error, Result};

// Payload bytes travel base64-encoded inside JSON frames.
mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One newline-delimited JSON frame on a submit connection. A connection
/// carries either a single `submit.unary`, or a `submit.open` followed by
/// `submit.data` frames until the client half-closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SubmitFrame {
    #[serde(rename = "submit.unary", rename_all = "camelCase")]
    Unary {
        ts: String,
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(with = "b64")]
        bytes: Vec<u8>,
        is_first: bool,
        is_last: bool,
    },
    #[serde(rename = "submit.open", rename_all = "camelCase")]
    Open {
        ts: String,
        field: String,
        filename: String,
        is_first: bool,
    },
    #[serde(rename = "submit.data", rename_all = "camelCase")]
    Data {
        ts: String,
        field: String,
        index: u32,
        #[serde(with = "b64")]
        bytes: Vec<u8>,
        is_last: bool,
    },
}

impl SubmitFrame {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end()).map_err(|e| Error::InvalidFrame {
            message: e.to_string(),
        })
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn into_message(self) -> Message {
        match self {
            SubmitFrame::Unary {
                ts,
                field,
                filename,
                bytes,
                is_first,
                is_last,
            } => Message::Unary {
                ts,
                field,
                filename,
                bytes,
                is_first,
                is_last,
            },
            SubmitFrame::Open {
                ts,
                field,
                filename,
                is_first,
            } => Message::StreamInfo {
                ts,
                field,
                filename,
                is_first,
            },
            SubmitFrame::Data {
                ts,
                field,
                index,
                bytes,
                is_last,
            } => Message::StreamData {
                ts,
                field,
                index,
                bytes,
                is_last,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitError {
    pub code: String,
    pub message: String,
}

/// Single acknowledgement written back per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(rename = "type")]
    pub type_: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parked: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SubmitError>,
}

impl SubmitResponse {
    pub fn ok(bytes_received: u64, parked: u32) -> Self {
        Self {
            type_: "submit.response".to_string(),
            ok: true,
            bytes_received: Some(bytes_received),
            parked: (parked > 0).then_some(parked),
            error: None,
        }
    }

    pub fn err(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: "submit.response".to_string(),
            ok: false,
            bytes_received: None,
            parked: None,
            error: Some(SubmitError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_json() {
        let frames = [
            SubmitFrame::Unary {
                ts: "001".to_string(),
                field: "alice".to_string(),
                filename: None,
                bytes: b"azaza".to_vec(),
                is_first: true,
                is_last: true,
            },
            SubmitFrame::Open {
                ts: "005".to_string(),
                field: "alice".to_string(),
                filename: "first.txt".to_string(),
                is_first: true,
            },
            SubmitFrame::Data {
                ts: "005".to_string(),
                field: "alice".to_string(),
                index: 1,
                bytes: b"bzbzbz".to_vec(),
                is_last: true,
            },
        ];
        for frame in frames {
            let line = frame.to_line().unwrap();
            assert_eq!(SubmitFrame::parse(&line).unwrap(), frame);
        }
    }

    #[test]
    fn frame_json_shape_is_tagged_camel_case() {
        let frame = SubmitFrame::Data {
            ts: "005".to_string(),
            field: "alice".to_string(),
            index: 0,
            bytes: b"azaza".to_vec(),
            is_last: false,
        };
        let v: serde_json::Value = serde_json::from_str(&frame.to_line().unwrap()).unwrap();
        assert_eq!(v["type"], "submit.data");
        assert_eq!(v["isLast"], false);
        assert_eq!(v["bytes"], "YXphemE=");

        // text unary omits the filename key entirely
        let frame = SubmitFrame::Unary {
            ts: "001".to_string(),
            field: "alice".to_string(),
            filename: None,
            bytes: Vec::new(),
            is_first: true,
            is_last: true,
        };
        let v: serde_json::Value = serde_json::from_str(&frame.to_line().unwrap()).unwrap();
        assert!(v.get("filename").is_none());
    }

    #[test]
    fn parse_rejects_garbage_with_frame_error() {
        let err = SubmitFrame::parse("{\"type\":\"submit.bogus\"}").unwrap_err();
        assert!(matches!(err, Error::InvalidFrame { .. }));
        assert_eq!(err.code(), "frame.invalid");

        let err = SubmitFrame::parse("not json").unwrap_err();
        assert!(matches!(err, Error::InvalidFrame { .. }));
    }

    #[test]
    fn frames_convert_into_messages() {
        let msg = SubmitFrame::Open {
            ts: "005".to_string(),
            field: "alice".to_string(),
            filename: "first.txt".to_string(),
            is_first: true,
        }
        .into_message();
        assert!(msg.is_stream_info());
        assert_eq!(msg.filename(), Some("first.txt"));

        let msg = SubmitFrame::Data {
            ts: "005".to_string(),
            field: "alice".to_string(),
            index: 2,
            bytes: b"cz".to_vec(),
            is_last: true,
        }
        .into_message();
        assert!(msg.is_stream_data());
        assert_eq!(msg.index(), 2);
        assert!(msg.is_last());
    }

    #[test]
    fn responses_serialize_sparsely() {
        let ok = SubmitResponse::ok(11, 0);
        let v: serde_json::Value = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["type"], "submit.response");
        assert_eq!(v["ok"], true);
        assert_eq!(v["bytesReceived"], 11);
        assert!(v.get("parked").is_none());
        assert!(v.get("error").is_none());

        let err = SubmitResponse::err("frame.invalid", "bad frame");
        let v: serde_json::Value = serde_json::to_value(&err).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "frame.invalid");
    }
}
