use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{Signal, SignalStatus};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignalParseError {
    #[error("no signal JSON object found in agent output")]
    NoSignalFound,
    #[error("signal object is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("signal object has invalid status `{0}`; expected PASS, NEEDS_WORK, or ERROR")]
    InvalidStatus(String),
}

/// Raw shape used only to probe a JSON-object line before committing to the
/// stricter typed `Signal`, so we can distinguish "not a signal line" from
/// "a signal line with a bad status".
#[derive(Deserialize)]
struct RawSignal {
    status: String,
    feedback: Option<String>,
    #[serde(default)]
    files_changed: Vec<String>,
    summary: Option<String>,
    commit_hash: Option<String>,
}

/// Extract the last well-formed signal object appearing on its own line of
/// agent stdout, ignoring lines inside fenced code blocks (``` ... ```).
///
/// Multiple signal lines may appear across retries/thinking output; only the
/// last one governs. A line that looks like a signal (has `status`,
/// `feedback`, `summary` keys) but carries an unrecognised `status` value is
/// an error, not skipped in favor of an earlier line.
pub fn parse_signal(stdout: &str) -> Result<Signal, SignalParseError> {
    let mut in_fence = false;
    let mut last: Option<RawSignal> = None;

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let Some(obj) = value.as_object() else {
            continue;
        };
        // A signal line must at least claim to carry these three keys;
        // anything else is incidental JSON in the transcript.
        if !obj.contains_key("status") || !obj.contains_key("feedback") || !obj.contains_key("summary") {
            continue;
        }

        match serde_json::from_value::<RawSignal>(value) {
            Ok(raw) => last = Some(raw),
            Err(_) => continue,
        }
    }

    let raw = last.ok_or(SignalParseError::NoSignalFound)?;

    let status = match raw.status.as_str() {
        "PASS" => SignalStatus::Pass,
        "NEEDS_WORK" => SignalStatus::NeedsWork,
        "ERROR" => SignalStatus::Error,
        other => return Err(SignalParseError::InvalidStatus(other.to_string())),
    };
    let feedback = raw.feedback.ok_or(SignalParseError::MissingField("feedback"))?;
    let summary = raw.summary.ok_or(SignalParseError::MissingField("summary"))?;

    Ok(Signal {
        status,
        feedback,
        files_changed: raw.files_changed,
        summary,
        commit_hash: raw.commit_hash,
    })
}
