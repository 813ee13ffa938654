//! Decoded snapshot layout: an explicit per-file index followed by payloads.
//!
//! ```text
//! "DGB1" | index_len u32 LE | JSON [{path, size, modified}] | payload 0 | payload 1 | ...
//! ```
//!
//! Every full snapshot, whatever tier or codec holds it, decodes to this form,
//! and binary deltas are computed between two bundles.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const BUNDLE_MAGIC: &[u8; 4] = b"DGB1";
const PREFIX_LEN: usize = 8;

/// One file recorded in a bundle index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    /// Normalized repository-relative path
    pub path: String,
    /// Payload length
    pub size: u64,
    /// Modification time at commit
    pub modified: DateTime<Utc>,
}

/// Encode the magic, length prefix and JSON index.
pub fn encode_header(entries: &[BundleEntry]) -> StoreResult<Vec<u8>> {
    let index = serde_json::to_vec(entries)?;
    let index_len = u32::try_from(index.len())
        .map_err(|_| StoreError::Serialization("bundle index exceeds 4 GiB".to_string()))?;
    let mut out = Vec::with_capacity(PREFIX_LEN + index.len());
    out.extend_from_slice(BUNDLE_MAGIC);
    out.extend_from_slice(&index_len.to_le_bytes());
    out.extend_from_slice(&index);
    Ok(out)
}

/// Build a complete bundle in memory.
pub fn build(files: &[(BundleEntry, &[u8])]) -> StoreResult<Vec<u8>> {
    let entries: Vec<BundleEntry> = files.iter().map(|(e, _)| e.clone()).collect();
    let mut out = encode_header(&entries)?;
    for (entry, payload) in files {
        if entry.size != payload.len() as u64 {
            return Err(StoreError::Serialization(format!(
                "bundle entry {} declares {} bytes, payload has {}",
                entry.path,
                entry.size,
                payload.len()
            )));
        }
        out.extend_from_slice(payload);
    }
    Ok(out)
}

/// A parsed, borrowed view over bundle bytes.
#[derive(Debug)]
pub struct Bundle<'a> {
    entries: Vec<BundleEntry>,
    offsets: Vec<usize>,
    data: &'a [u8],
}

impl<'a> Bundle<'a> {
    /// Parse and bounds-check a bundle. `key` names the artifact in errors.
    pub fn parse(data: &'a [u8], key: &str) -> StoreResult<Self> {
        if data.len() < PREFIX_LEN || &data[..4] != BUNDLE_MAGIC {
            return Err(StoreError::corrupt(key, "missing bundle magic"));
        }
        let index_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let payload_start = PREFIX_LEN
            .checked_add(index_len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| StoreError::corrupt(key, "bundle index truncated"))?;
        let entries: Vec<BundleEntry> = serde_json::from_slice(&data[PREFIX_LEN..payload_start])
            .map_err(|e| StoreError::corrupt(key, format!("bundle index: {}", e)))?;

        let mut offsets = Vec::with_capacity(entries.len());
        let mut offset = payload_start;
        for entry in &entries {
            offsets.push(offset);
            offset = usize::try_from(entry.size)
                .ok()
                .and_then(|size| offset.checked_add(size))
                .filter(|end| *end <= data.len())
                .ok_or_else(|| {
                    StoreError::corrupt(key, format!("payload for {} truncated", entry.path))
                })?;
        }
        if offset != data.len() {
            return Err(StoreError::corrupt(key, "trailing bytes after last payload"));
        }
        Ok(Self {
            entries,
            offsets,
            data,
        })
    }

    /// Index entries in storage order.
    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    /// Look up an entry by exact path.
    pub fn find(&self, path: &str) -> Option<(&BundleEntry, &'a [u8])> {
        self.entries
            .iter()
            .position(|e| e.path == path)
            .map(|i| (&self.entries[i], self.payload(i)))
    }

    /// Iterate entries with their payloads.
    pub fn files(&self) -> impl Iterator<Item = (&BundleEntry, &'a [u8])> + '_ {
        (0..self.entries.len()).map(move |i| (&self.entries[i], self.payload(i)))
    }

    fn payload(&self, i: usize) -> &'a [u8] {
        let start = self.offsets[i];
        &self.data[start..start + self.entries[i].size as usize]
    }
}
