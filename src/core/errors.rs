// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::{ParseFloatError, ParseIntError};
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the proxy.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum StrideError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("Origin request timed out")]
    OriginTimeout,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request is not a time range query the origin adapter understands.
    #[error("Not a time range query: {0}")]
    NotTimeRangeQuery(String),

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    #[error("value is not a valid float")]
    NotAFloat,

    #[error("Cache codec error: {0}")]
    Codec(String),

    #[error("Unsupported cache document version {0}")]
    UnsupportedDocumentVersion(u8),

    #[error("Timeseries unmarshal error: {0}")]
    Unmarshal(String),

    // --- Collapse forwarder errors ---
    /// A reader asked for a chunk beyond the pre-allocated slot count.
    #[error("read index too large")]
    ReadIndexTooLarge,

    /// The writer has used every pre-allocated chunk slot.
    #[error("write slots exhausted")]
    WriteSlotsExhausted,

    /// The writer has closed and every chunk has been delivered.
    #[error("end of stream")]
    EndOfStream,

    /// The body was requested before the writer closed.
    #[error("server request not completed")]
    ServerRequestIncomplete,

    /// The origin body failed part way through.
    #[error("origin response aborted")]
    OriginAborted,

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for StrideError {
    fn clone(&self) -> Self {
        match self {
            StrideError::Io(e) => StrideError::Io(Arc::clone(e)),
            StrideError::HttpClientError(s) => StrideError::HttpClientError(s.clone()),
            StrideError::OriginTimeout => StrideError::OriginTimeout,
            StrideError::KeyNotFound => StrideError::KeyNotFound,
            StrideError::InvalidRequest(s) => StrideError::InvalidRequest(s.clone()),
            StrideError::NotTimeRangeQuery(s) => StrideError::NotTimeRangeQuery(s.clone()),
            StrideError::NotAnInteger => StrideError::NotAnInteger,
            StrideError::NotAFloat => StrideError::NotAFloat,
            StrideError::Codec(s) => StrideError::Codec(s.clone()),
            StrideError::UnsupportedDocumentVersion(v) => StrideError::UnsupportedDocumentVersion(*v),
            StrideError::Unmarshal(s) => StrideError::Unmarshal(s.clone()),
            StrideError::ReadIndexTooLarge => StrideError::ReadIndexTooLarge,
            StrideError::WriteSlotsExhausted => StrideError::WriteSlotsExhausted,
            StrideError::EndOfStream => StrideError::EndOfStream,
            StrideError::ServerRequestIncomplete => StrideError::ServerRequestIncomplete,
            StrideError::OriginAborted => StrideError::OriginAborted,
            StrideError::Internal(s) => StrideError::Internal(s.clone()),
        }
    }
}

impl PartialEq for StrideError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StrideError::Io(e1), StrideError::Io(e2)) => e1.to_string() == e2.to_string(),
            (StrideError::HttpClientError(s1), StrideError::HttpClientError(s2)) => s1 == s2,
            (StrideError::InvalidRequest(s1), StrideError::InvalidRequest(s2)) => s1 == s2,
            (StrideError::NotTimeRangeQuery(s1), StrideError::NotTimeRangeQuery(s2)) => s1 == s2,
            (StrideError::Codec(s1), StrideError::Codec(s2)) => s1 == s2,
            (
                StrideError::UnsupportedDocumentVersion(v1),
                StrideError::UnsupportedDocumentVersion(v2),
            ) => v1 == v2,
            (StrideError::Unmarshal(s1), StrideError::Unmarshal(s2)) => s1 == s2,
            (StrideError::Internal(s1), StrideError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for StrideError {
    fn from(e: std::io::Error) -> Self {
        StrideError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for StrideError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StrideError::OriginTimeout
        } else {
            StrideError::HttpClientError(e.to_string())
        }
    }
}

impl From<serde_json::Error> for StrideError {
    fn from(e: serde_json::Error) -> Self {
        StrideError::Unmarshal(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for StrideError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StrideError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for StrideError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StrideError::Codec(e.to_string())
    }
}

impl From<url::ParseError> for StrideError {
    fn from(e: url::ParseError) -> Self {
        StrideError::InvalidRequest(format!("invalid url: {e}"))
    }
}

impl From<ParseIntError> for StrideError {
    fn from(_: ParseIntError) -> Self {
        StrideError::NotAnInteger
    }
}

impl From<ParseFloatError> for StrideError {
    fn from(_: ParseFloatError) -> Self {
        StrideError::NotAFloat
    }
}
