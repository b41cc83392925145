//! WorkItem <-> broker message mapping
//!
//! Every message is keyed by the item's source URL. The value carries the one
//! field the consuming stage needs (see [`Payload`]); the remaining fields
//! travel as headers. Failed items go to the errors topic as full JSON so
//! the Writer sees everything the failing stage knew.

use pixflow_broker::Message;
use pixflow_common::{ContentHash, ErrorInfo, ErrorKind, Stage, WorkItem};
use std::path::PathBuf;
use thiserror::Error;

pub const HEADER_INPUT: &str = "input";
pub const HEADER_OUTPUT: &str = "output";
pub const HEADER_CONTENT_HASH: &str = "content-hash";
pub const HEADER_S3URL: &str = "s3url";
pub const HEADER_STAGE: &str = "stage";
pub const HEADER_ERROR_KIND: &str = "error-kind";
pub const HEADER_ERROR: &str = "error";
pub const HEADER_ATTEMPTS: &str = "attempts";

/// Which field of the item is carried as the message value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// `ingest`: the source URL
    Url,
    /// `downloaded`: local input path
    InputPath,
    /// `converted`: local output path
    OutputPath,
    /// `uploaded`: public object URL
    RemoteUrl,
    /// `errors`: the whole item as JSON
    Failure,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("message key is missing or not UTF-8")]
    InvalidKey,

    #[error("message value is not UTF-8")]
    InvalidValue,

    #[error("message value is empty")]
    EmptyValue,

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    #[error("failure payload is not a valid work item: {0}")]
    Json(#[from] pixflow_common::PixflowError),
}

pub fn encode(item: &WorkItem, payload: Payload) -> Result<Message, CodecError> {
    let value = match payload {
        Payload::Url => item.url.clone().into_bytes(),
        Payload::InputPath => path_bytes(item.local_input_path.as_ref()),
        Payload::OutputPath => path_bytes(item.local_output_path.as_ref()),
        Payload::RemoteUrl => item.remote_url.clone().unwrap_or_default().into_bytes(),
        Payload::Failure => item.to_json()?,
    };

    let mut message = Message::new(item.url.as_bytes(), value);

    if let Some(path) = &item.local_input_path {
        message = message.with_header(HEADER_INPUT, path.to_string_lossy().into_owned());
    }
    if let Some(path) = &item.local_output_path {
        message = message.with_header(HEADER_OUTPUT, path.to_string_lossy().into_owned());
    }
    if let Some(hash) = &item.content_hash {
        message = message.with_header(HEADER_CONTENT_HASH, hash.to_hex());
    }
    if let Some(url) = &item.remote_url {
        message = message.with_header(HEADER_S3URL, url.as_str());
    }
    if let Some(error) = &item.error {
        message = message
            .with_header(HEADER_STAGE, error.stage.as_str())
            .with_header(HEADER_ERROR_KIND, error.kind.as_str())
            .with_header(HEADER_ERROR, error.message.as_str())
            .with_header(HEADER_ATTEMPTS, error.attempts.to_string());
    }

    Ok(message)
}

pub fn decode(message: &Message, payload: Payload) -> Result<WorkItem, CodecError> {
    let url = message
        .key_str()
        .filter(|k| !k.is_empty())
        .ok_or(CodecError::InvalidKey)?;

    if payload == Payload::Failure {
        if let Ok(mut item) = WorkItem::from_json(&message.value) {
            item.url = url.to_string();
            return Ok(item);
        }
        // Producers that only set headers still get their failure reported
        let mut item = decode_headers(url, message)?;
        item.error = Some(error_from_headers(message)?);
        return Ok(item);
    }

    let mut item = decode_headers(url, message)?;
    if message.header_str(HEADER_STAGE).is_some() {
        item.error = Some(error_from_headers(message)?);
    }
    let value = message.value_str().ok_or(CodecError::InvalidValue)?;
    if value.is_empty() {
        return Err(CodecError::EmptyValue);
    }

    match payload {
        Payload::Url | Payload::Failure => {}
        Payload::InputPath => item.local_input_path = Some(PathBuf::from(value)),
        Payload::OutputPath => item.local_output_path = Some(PathBuf::from(value)),
        Payload::RemoteUrl => item.remote_url = Some(value.to_string()),
    }
    Ok(item)
}

fn decode_headers(url: &str, message: &Message) -> Result<WorkItem, CodecError> {
    let mut item = WorkItem::new(url);
    item.local_input_path = message.header_str(HEADER_INPUT).map(PathBuf::from);
    item.local_output_path = message.header_str(HEADER_OUTPUT).map(PathBuf::from);
    item.remote_url = message.header_str(HEADER_S3URL).map(str::to_string);
    item.content_hash = message
        .header_str(HEADER_CONTENT_HASH)
        .map(ContentHash::from_hex)
        .transpose()
        .map_err(|e| CodecError::InvalidHeader {
            name: HEADER_CONTENT_HASH,
            reason: e.to_string(),
        })?;
    Ok(item)
}

fn error_from_headers(message: &Message) -> Result<ErrorInfo, CodecError> {
    let stage = match message.header_str(HEADER_STAGE) {
        Some(raw) => raw.parse::<Stage>().map_err(|e| CodecError::InvalidHeader {
            name: HEADER_STAGE,
            reason: e.to_string(),
        })?,
        None => {
            return Err(CodecError::InvalidHeader {
                name: HEADER_STAGE,
                reason: "missing".to_string(),
            })
        }
    };
    let kind = message
        .header_str(HEADER_ERROR_KIND)
        .and_then(|raw| raw.parse::<ErrorKind>().ok())
        .unwrap_or(ErrorKind::Permanent);
    let attempts = message
        .header_str(HEADER_ATTEMPTS)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(1);
    let text = message.header_str(HEADER_ERROR).unwrap_or("unknown error");

    Ok(ErrorInfo::new(stage, kind, text).with_attempts(attempts))
}

fn path_bytes(path: Option<&PathBuf>) -> Vec<u8> {
    path.map(|p| p.to_string_lossy().into_owned().into_bytes())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pixflow_common::checksum::ContentHasher;

    fn downloaded_item() -> WorkItem {
        let mut hasher = ContentHasher::new();
        hasher.update(b"image bytes");
        let mut item = WorkItem::new("http://example.com/a.png");
        item.local_input_path = Some(PathBuf::from("/data/a-20240101.png"));
        item.content_hash = Some(hasher.finalize());
        item
    }

    #[test]
    fn test_downloaded_message_layout() {
        let item = downloaded_item();
        let msg = encode(&item, Payload::InputPath).unwrap();

        assert_eq!(msg.key_str(), Some("http://example.com/a.png"));
        assert_eq!(msg.value_str(), Some("/data/a-20240101.png"));
        assert_eq!(msg.header_str(HEADER_INPUT), Some("/data/a-20240101.png"));
        assert_eq!(msg.header_str(HEADER_CONTENT_HASH).map(str::len), Some(64));
        assert!(msg.header_str(HEADER_OUTPUT).is_none());

        assert_eq!(decode(&msg, Payload::InputPath).unwrap(), item);
    }

    #[test]
    fn test_value_is_authoritative_over_headers() {
        let msg = Message::new("http://example.com/a.png", "/data/b-converted.png")
            .with_header(HEADER_INPUT, "/data/b.png")
            .with_header(HEADER_OUTPUT, "/stale/path.png");

        let item = decode(&msg, Payload::OutputPath).unwrap();
        assert_eq!(item.local_output_path, Some(PathBuf::from("/data/b-converted.png")));
        assert_eq!(item.local_input_path, Some(PathBuf::from("/data/b.png")));
    }

    #[test]
    fn test_failure_carries_error_in_json_and_headers() {
        let item = WorkItem::new("http://example.com/forbidden.png").fail(
            ErrorInfo::new(Stage::Downloader, ErrorKind::Transient, "HTTP status 403 (Forbidden)")
                .with_attempts(4),
        );
        let msg = encode(&item, Payload::Failure).unwrap();

        assert_eq!(msg.header_str(HEADER_STAGE), Some("downloader"));
        assert_eq!(msg.header_str(HEADER_ERROR_KIND), Some("transient"));
        assert_eq!(msg.header_str(HEADER_ATTEMPTS), Some("4"));

        let decoded = decode(&msg, Payload::Failure).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_failure_from_headers_only() {
        let msg = Message::new("http://example.com/x.png", "")
            .with_header(HEADER_STAGE, "uploader")
            .with_header(HEADER_ERROR, "bucket missing");

        let item = decode(&msg, Payload::Failure).unwrap();
        let error = item.error.unwrap();
        assert_eq!(error.stage, Stage::Uploader);
        assert_eq!(error.kind, ErrorKind::Permanent);
        assert_eq!(error.message, "bucket missing");
    }

    #[test]
    fn test_error_headers_survive_on_stage_topics() {
        let item = downloaded_item().fail(ErrorInfo::new(Stage::Reader, ErrorKind::Permanent, "bad row"));
        let msg = encode(&item, Payload::InputPath).unwrap();

        let decoded = decode(&msg, Payload::InputPath).unwrap();
        assert!(decoded.is_failed());
        assert_eq!(decoded.error.unwrap().stage, Stage::Reader);
    }

    #[test]
    fn test_rejects_missing_key_and_empty_value() {
        let no_key = Message::new(Vec::new(), "/data/a.png");
        assert!(matches!(decode(&no_key, Payload::InputPath), Err(CodecError::InvalidKey)));

        let empty = Message::new("http://example.com/a.png", "");
        assert!(matches!(decode(&empty, Payload::OutputPath), Err(CodecError::EmptyValue)));
    }

    #[test]
    fn test_bad_hash_header_is_rejected() {
        let msg = Message::new("http://example.com/a.png", "/data/a.png")
            .with_header(HEADER_CONTENT_HASH, "not-hex");
        assert!(matches!(
            decode(&msg, Payload::InputPath),
            Err(CodecError::InvalidHeader { name: HEADER_CONTENT_HASH, .. })
        ));
    }
}
