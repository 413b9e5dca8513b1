//! Parser for the tagged line protocol workers speak on stdout.
//!
//! Workers emit `[WEBSOCKET_PROGRESS] <json>`, `[WEBSOCKET_STATUS] <json>`,
//! and `[WEBSOCKET_ERROR] <json>`, one payload per line. Anything else is
//! captured verbatim as an output event, classified by severity tokens.
//! Tagged lines never influence the stage outcome; only exit codes do.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::hub::events::OutputLevel;
use crate::runner::worker::{WorkerFailure, WorkerUpdate};

pub const PROGRESS_TAG: &str = "[WEBSOCKET_PROGRESS]";
pub const STATUS_TAG: &str = "[WEBSOCKET_STATUS]";
pub const ERROR_TAG: &str = "[WEBSOCKET_ERROR]";

#[derive(Debug, Deserialize)]
struct WireProgress {
    current: u64,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    status: String,
    #[serde(default)]
    message: String,
}

/// Parse one stdout line into a worker update. Empty lines yield `None`.
pub fn parse_line(line: &str) -> Option<WorkerUpdate> {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(payload) = trimmed.strip_prefix(PROGRESS_TAG) {
        return Some(match serde_json::from_str::<WireProgress>(payload.trim()) {
            Ok(p) => WorkerUpdate::Progress {
                current: p.current,
                total: p.total,
                message: p.message,
                details: p.details,
            },
            Err(_) => malformed(trimmed),
        });
    }
    if let Some(payload) = trimmed.strip_prefix(STATUS_TAG) {
        return Some(match serde_json::from_str::<WireStatus>(payload.trim()) {
            Ok(s) => WorkerUpdate::Status {
                status: s.status,
                message: s.message,
            },
            Err(_) => malformed(trimmed),
        });
    }
    if let Some(payload) = trimmed.strip_prefix(ERROR_TAG) {
        return Some(match serde_json::from_str::<WorkerFailure>(payload.trim()) {
            Ok(failure) => WorkerUpdate::Error(failure),
            Err(_) => malformed(trimmed),
        });
    }

    Some(WorkerUpdate::Output {
        level: classify_severity(trimmed),
        message: trimmed.to_string(),
    })
}

fn malformed(line: &str) -> WorkerUpdate {
    WorkerUpdate::Output {
        level: OutputLevel::Warning,
        message: line.to_string(),
    }
}

/// Severity classification for untagged lines.
pub fn classify_severity(line: &str) -> OutputLevel {
    static ERROR_RE: OnceLock<Regex> = OnceLock::new();
    static WARN_RE: OnceLock<Regex> = OnceLock::new();
    static SUCCESS_RE: OnceLock<Regex> = OnceLock::new();

    let error_re = ERROR_RE
        .get_or_init(|| Regex::new(r"(?i)\b(error|fatal|failed|panic)\b").expect("static regex"));
    let warn_re =
        WARN_RE.get_or_init(|| Regex::new(r"(?i)\b(warn|warning|retry(ing)?)\b").expect("static regex"));
    let success_re = SUCCESS_RE
        .get_or_init(|| Regex::new(r"(?i)\b(success|succeeded|done|finished)\b").expect("static regex"));

    if error_re.is_match(line) {
        OutputLevel::Error
    } else if warn_re.is_match(line) {
        OutputLevel::Warning
    } else if success_re.is_match(line) {
        OutputLevel::Success
    } else {
        OutputLevel::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_payload() {
        let line = r#"[WEBSOCKET_PROGRESS] {"current": 3, "total": 10, "message": "day 2025-06-03"}"#;
        match parse_line(line).unwrap() {
            WorkerUpdate::Progress {
                current,
                total,
                message,
                ..
            } => {
                assert_eq!(current, 3);
                assert_eq!(total, Some(10));
                assert_eq!(message, "day 2025-06-03");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_progress_without_total() {
        let line = r#"[WEBSOCKET_PROGRESS] {"current": 7}"#;
        match parse_line(line).unwrap() {
            WorkerUpdate::Progress { current, total, .. } => {
                assert_eq!(current, 7);
                assert_eq!(total, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_status_payload() {
        let line = r#"[WEBSOCKET_STATUS] {"status": "fetching", "message": "index page"}"#;
        match parse_line(line).unwrap() {
            WorkerUpdate::Status { status, message } => {
                assert_eq!(status, "fetching");
                assert_eq!(message, "index page");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_error_payload() {
        let line = r#"[WEBSOCKET_ERROR] {"code": "http_403", "message": "blocked", "recoverable": false}"#;
        match parse_line(line).unwrap() {
            WorkerUpdate::Error(failure) => {
                assert_eq!(failure.code, "http_403");
                assert!(!failure.recoverable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_tagged_payload_degrades_to_warning_output() {
        let line = "[WEBSOCKET_PROGRESS] {not json";
        match parse_line(line).unwrap() {
            WorkerUpdate::Output { level, message } => {
                assert_eq!(level, OutputLevel::Warning);
                assert!(message.contains("WEBSOCKET_PROGRESS"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn untagged_lines_are_output_verbatim() {
        match parse_line("fetched 12 files").unwrap() {
            WorkerUpdate::Output { level, message } => {
                assert_eq!(level, OutputLevel::Info);
                assert_eq!(message, "fetched 12 files");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn severity_tokens_classify_untagged_lines() {
        assert_eq!(classify_severity("ERROR: no such file"), OutputLevel::Error);
        assert_eq!(classify_severity("download failed"), OutputLevel::Error);
        assert_eq!(
            classify_severity("warning: slow response, retrying"),
            OutputLevel::Warning
        );
        assert_eq!(classify_severity("all done"), OutputLevel::Success);
        assert_eq!(classify_severity("processing page 3"), OutputLevel::Info);
    }

    #[test]
    fn empty_lines_yield_nothing() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
    }
}
