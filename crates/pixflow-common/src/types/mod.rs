//! Common types used across the pipeline stages

use crate::error::PixflowError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;

// ============================================================================
// Stages
// ============================================================================

/// Pipeline stage that produced or touched an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Reader,
    Downloader,
    Converter,
    Uploader,
    Writer,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Reader => "reader",
            Stage::Downloader => "downloader",
            Stage::Converter => "converter",
            Stage::Uploader => "uploader",
            Stage::Writer => "writer",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = PixflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reader" => Ok(Stage::Reader),
            "downloader" => Ok(Stage::Downloader),
            "converter" => Ok(Stage::Converter),
            "uploader" => Ok(Stage::Uploader),
            "writer" => Ok(Stage::Writer),
            _ => Err(PixflowError::UnknownStage(s.to_string())),
        }
    }
}

// ============================================================================
// Errors carried on items
// ============================================================================

/// Classification of a terminal item failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or bad-status failure whose retry budget ran out
    Transient,
    /// Content, transform or upload failure that will not succeed on retry
    Permanent,
    /// Local file could not be created, opened or read
    LocalIo,
    /// The stage was shutting down before the item could finish
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::LocalIo => "local_io",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = PixflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "permanent" => Ok(ErrorKind::Permanent),
            "local_io" => Ok(ErrorKind::LocalIo),
            "cancelled" => Ok(ErrorKind::Cancelled),
            _ => Err(PixflowError::UnknownErrorKind(s.to_string())),
        }
    }
}

/// Context attached to an item once a stage gives up on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    /// Attempts made before giving up (1 for non-retried failures)
    pub attempts: u32,
}

impl ErrorInfo {
    pub fn new(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)?;
        if self.attempts > 1 {
            write!(f, " (after {} attempts)", self.attempts)?;
        }
        Ok(())
    }
}

// ============================================================================
// Content hash
// ============================================================================

/// SHA-256 digest of downloaded bytes, hex encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, PixflowError> {
        let decoded = hex::decode(s).map_err(|e| PixflowError::InvalidHash(e.to_string()))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| PixflowError::InvalidHash(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Work items
// ============================================================================

/// The unit of work flowing through the pipeline, identified by its URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Source URL; dedup key and partition key for every message of this item
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_input_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl WorkItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            local_input_path: None,
            local_output_path: None,
            remote_url: None,
            content_hash: None,
            error: None,
        }
    }

    /// Whether a stage has already given up on this item
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Mark the item as terminally failed.
    ///
    /// The first recorded error wins; an item is never re-failed by a later stage.
    pub fn fail(mut self, error: ErrorInfo) -> Self {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    /// Serialize to the JSON form used on the errors topic
    pub fn to_json(&self) -> std::result::Result<Vec<u8>, PixflowError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> std::result::Result<Self, PixflowError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_from_str() {
        assert_eq!("downloader".parse::<Stage>().unwrap(), Stage::Downloader);
        assert_eq!("Uploader".parse::<Stage>().unwrap(), Stage::Uploader);
        assert!("packager".parse::<Stage>().is_err());
    }

    #[test]
    fn test_error_kind_round_trip_names() {
        for kind in [
            ErrorKind::Transient,
            ErrorKind::Permanent,
            ErrorKind::LocalIo,
            ErrorKind::Cancelled,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_first_error_wins() {
        let item = WorkItem::new("http://example.com/a.png")
            .fail(ErrorInfo::new(Stage::Downloader, ErrorKind::Transient, "HTTP 503"))
            .fail(ErrorInfo::new(Stage::Converter, ErrorKind::Permanent, "boom"));

        let error = item.error.unwrap();
        assert_eq!(error.stage, Stage::Downloader);
        assert_eq!(error.message, "HTTP 503");
    }

    #[test]
    fn test_error_info_display_includes_attempts() {
        let info = ErrorInfo::new(Stage::Downloader, ErrorKind::Transient, "HTTP status 403")
            .with_attempts(4);
        assert_eq!(info.to_string(), "downloader: HTTP status 403 (after 4 attempts)");

        let single = ErrorInfo::new(Stage::Converter, ErrorKind::Permanent, "bad input");
        assert_eq!(single.to_string(), "converter: bad input");
    }

    #[test]
    fn test_content_hash_hex() {
        let hash = ContentHash::from_bytes([0xab; 32]);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex).unwrap(), hash);
        assert!(ContentHash::from_hex("abcd").is_err());
        assert!(ContentHash::from_hex("zz").is_err());
    }

    #[test]
    fn test_work_item_json_skips_empty_fields() {
        let item = WorkItem::new("http://example.com/a.png");
        let json = String::from_utf8(item.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"url":"http://example.com/a.png"}"#);

        let mut full = item.clone();
        full.local_input_path = Some(PathBuf::from("/tmp/a.png"));
        full.content_hash = Some(ContentHash::from_bytes([1; 32]));
        let parsed = WorkItem::from_json(&full.to_json().unwrap()).unwrap();
        assert_eq!(parsed, full);
    }
}
