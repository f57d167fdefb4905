//! SenML envelope used on the MQTT payloads
//!
//! Only `bn`, `n`, `vs` of the first record are read; egress packs carry a
//! single record with those three fields plus `t`.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One SenML record (unknown fields are ignored on decode)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "bn", default, skip_serializing_if = "Option::is_none")]
    pub base_name: Option<String>,
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "vs", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

/// First record of a decoded pack, with the correlation id already stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub uuid: String,
    pub name: String,
    pub string_value: String,
}

/// Decode a JSON SenML pack
pub fn decode(payload: &[u8]) -> Result<Frame> {
    let records: Vec<Record> =
        serde_json::from_slice(payload).map_err(|e| AgentError::DecodeFailed(e.to_string()))?;
    let first = records
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::DecodeFailed("empty SenML pack".to_string()))?;

    let base_name = first.base_name.unwrap_or_default();
    Ok(Frame {
        uuid: base_name.strip_suffix(':').unwrap_or(&base_name).to_string(),
        name: first.name.unwrap_or_default(),
        string_value: first.string_value.unwrap_or_default(),
    })
}

/// Encode a single-record pack; `bn` is written as `<uuid>:`
pub fn encode(uuid: &str, name: &str, string_value: &str) -> Result<Vec<u8>> {
    let record = Record {
        base_name: Some(format!("{uuid}:")),
        name: Some(name.to_string()),
        string_value: Some(string_value.to_string()),
        time: Some(now_seconds()),
    };
    serde_json::to_vec(&[record]).map_err(|e| AgentError::EncodeFailed(e.to_string()))
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_minimal_frame() {
        let frame = decode(br#"[{"bn":"R1:","n":"exec","vs":"echo,hello"}]"#).unwrap();
        assert_eq!(frame.uuid, "R1");
        assert_eq!(frame.name, "exec");
        assert_eq!(frame.string_value, "echo,hello");
    }

    #[test]
    fn test_decode_ignores_extra_fields_and_records() {
        let payload = br#"[{"bn":"abc","n":"term","vs":"b3Blbg==","u":"V","v":3},{"n":"other"}]"#;
        let frame = decode(payload).unwrap();
        assert_eq!(frame.uuid, "abc");
        assert_eq!(frame.name, "term");
    }

    #[test]
    fn test_decode_rejects_empty_and_garbage() {
        assert!(matches!(decode(b"[]"), Err(AgentError::DecodeFailed(_))));
        assert!(matches!(decode(b"not json"), Err(AgentError::DecodeFailed(_))));
    }

    #[test]
    fn test_reencoding_preserves_correlation_fields() {
        let original = decode(br#"[{"bn":"T9:","n":"term","vs":"a,b"}]"#).unwrap();
        let encoded = encode(&original.uuid, &original.name, &original.string_value).unwrap();
        assert_eq!(decode(&encoded).unwrap(), original);

        let records: Vec<Record> = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].base_name.as_deref(), Some("T9:"));
        assert!(records[0].time.unwrap() > 0.0);
    }
}
