// src/core/cache/codec.rs

//! The stored form of an `HttpDocument`: a format-version byte followed by
//! the bincode encoding, optionally zstd-compressed under a suffixed key.
//! Documents whose policy says `no-transform` are never compressed; a
//! zstd frame never starts with the version byte, so reads tell them apart.

use super::Cache;
use crate::core::errors::StrideError;
use crate::core::proxy::document::HttpDocument;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

pub const DOCUMENT_FORMAT_VERSION: u8 = 1;

/// Appended to the key of compressed entries.
pub const COMPRESSED_KEY_SUFFIX: &str = ".zst";

const ZSTD_LEVEL: i32 = 0;

pub fn encode_document(doc: &HttpDocument) -> Result<Vec<u8>, StrideError> {
    let mut out = vec![DOCUMENT_FORMAT_VERSION];
    out.extend(bincode::serde::encode_to_vec(
        doc,
        bincode::config::standard(),
    )?);
    Ok(out)
}

pub fn decode_document(bytes: &[u8]) -> Result<HttpDocument, StrideError> {
    let (&version, payload) = bytes
        .split_first()
        .ok_or_else(|| StrideError::Codec("empty cache document".to_string()))?;
    if version != DOCUMENT_FORMAT_VERSION {
        return Err(StrideError::UnsupportedDocumentVersion(version));
    }
    let (doc, _) =
        bincode::serde::decode_from_slice::<HttpDocument, _>(payload, bincode::config::standard())?;
    Ok(doc)
}

fn storage_key(cache: &dyn Cache, key: &str) -> String {
    if cache.configuration().compression {
        format!("{key}{COMPRESSED_KEY_SUFFIX}")
    } else {
        key.to_string()
    }
}

fn is_plain(raw: &[u8]) -> bool {
    raw.first() == Some(&DOCUMENT_FORMAT_VERSION)
}

/// Loads and decodes the document stored under `key`.
pub async fn query_cache(cache: &dyn Cache, key: &str) -> Result<HttpDocument, StrideError> {
    let storage_key = storage_key(cache, key);
    let raw = cache.retrieve(&storage_key).await?;

    let decoded = if cache.configuration().compression && !is_plain(&raw) {
        zstd::decode_all(raw.as_ref())?
    } else {
        raw.to_vec()
    };

    decode_document(&decoded).inspect_err(|e| {
        warn!("Failed to decode cached document '{}': {}", storage_key, e);
    })
}

/// Encodes `doc` and stores it under `key` for `ttl`.
pub async fn write_cache(
    cache: &dyn Cache,
    key: &str,
    doc: &HttpDocument,
    ttl: Duration,
) -> Result<(), StrideError> {
    let encoded = encode_document(doc)?;
    let no_transform = doc
        .caching_policy
        .as_ref()
        .is_some_and(|cp| cp.no_transform);
    let payload = if cache.configuration().compression && !no_transform {
        zstd::encode_all(encoded.as_slice(), ZSTD_LEVEL)?
    } else {
        encoded
    };

    let storage_key = storage_key(cache, key);
    debug!(
        "Writing {} bytes to cache key '{}' (ttl {:?})",
        payload.len(),
        storage_key,
        ttl
    );
    cache.store(&storage_key, Bytes::from(payload), ttl).await
}

/// Removes the entry for `key`, honoring the compression suffix.
pub async fn remove_document(cache: &dyn Cache, key: &str) {
    cache.remove(&storage_key(cache, key)).await;
}
