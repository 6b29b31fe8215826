//! Records streamed by the core's diagnostic `/logs` endpoint.
//!
//! Each line of the chunked response is one JSON object:
//!
//! ```json
//! {"type":"info","payload":"[1 5ms] outbound/direct: outbound connection to example.com:443"}
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLogRecord {
    /// Log level as reported by the core.
    #[serde(rename = "type", default)]
    pub log_type: String,
    pub payload: String,
}

impl RawLogRecord {
    /// Decodes one line. Blank or malformed lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let record =
            RawLogRecord::parse_line(r#"{"type":"warning","payload":"dial failed"}"#).unwrap();
        assert_eq!(record.log_type, "warning");
        assert_eq!(record.payload, "dial failed");
    }

    #[test]
    fn test_malformed_lines_dropped() {
        assert!(RawLogRecord::parse_line("").is_none());
        assert!(RawLogRecord::parse_line("   ").is_none());
        assert!(RawLogRecord::parse_line(r#"{"type":"info","pay"#).is_none());
        assert!(RawLogRecord::parse_line(r#"{"type":"info"}"#).is_none());
    }

    #[test]
    fn test_missing_type_defaults_empty() {
        let record = RawLogRecord::parse_line(r#"{"payload":"x"}"#).unwrap();
        assert!(record.log_type.is_empty());
    }
}
