// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distribution requests, packages and the package wire codec.
//!
//! A [`DistributionPackage`] is the immutable unit of transport: one
//! request's content-tree change plus metadata. Packages are shared between
//! queues through `Arc`, so a fan-out enqueue never copies the payload.
//!
//! # Wire Format
//!
//! ```text
//! JSON envelope ──▶ len > COMPRESSION_THRESHOLD ? zstd : raw ──▶ bytes
//! ```
//!
//! Decoding sniffs the zstd magic header, so both forms are accepted. The
//! envelope carries a SHA-256 checksum over the canonical JSON of the type,
//! paths and payload, verified on every decode; a mismatch is reported as
//! [`DistributionError::MalformedPackage`]. A DELETE carries its whole change
//! in `paths`, so the paths are covered too.
//!
//! Verification re-serializes the decoded payload, which only reproduces the
//! sender's bytes if floats parse back exactly (`serde_json/float_roundtrip`).

use crate::error::{DistributionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Encoded envelopes larger than this are zstd-compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const ZSTD_LEVEL: i32 = 3;

/// Kind of distribution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DistributionRequestType {
    /// Replicate the subtree at each path.
    Add,
    /// Remove each path.
    Delete,
    /// Retrieve what a passive queue has accumulated.
    Pull,
    /// Check that the agent can accept requests.
    Test,
}

impl DistributionRequestType {
    /// Parse a request type, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ADD" => Some(Self::Add),
            "DELETE" | "DEL" => Some(Self::Delete),
            "PULL" => Some(Self::Pull),
            "TEST" => Some(Self::Test),
            _ => None,
        }
    }
}

impl std::fmt::Display for DistributionRequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "ADD"),
            Self::Delete => write!(f, "DELETE"),
            Self::Pull => write!(f, "PULL"),
            Self::Test => write!(f, "TEST"),
        }
    }
}

/// A request to distribute content at one or more paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRequest {
    #[serde(rename = "type")]
    pub kind: DistributionRequestType,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl DistributionRequest {
    pub fn new<I, P>(kind: DistributionRequestType, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            kind,
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn add(path: impl Into<String>) -> Self {
        Self::new(DistributionRequestType::Add, [path])
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(DistributionRequestType::Delete, [path])
    }

    pub fn pull() -> Self {
        Self::new(DistributionRequestType::Pull, Vec::<String>::new())
    }

    pub fn test() -> Self {
        Self::new(DistributionRequestType::Test, Vec::<String>::new())
    }

    /// Check paths for the request type.
    ///
    /// ADD and DELETE need at least one path; every path must be absolute.
    pub fn validate(&self) -> Result<()> {
        if matches!(
            self.kind,
            DistributionRequestType::Add | DistributionRequestType::Delete
        ) && self.paths.is_empty()
        {
            return Err(DistributionError::Validation(format!(
                "{} request needs at least one path",
                self.kind
            )));
        }
        for path in &self.paths {
            if !path.starts_with('/') {
                return Err(DistributionError::Validation(format!(
                    "path must be absolute: {}",
                    path
                )));
            }
        }
        Ok(())
    }
}

/// A node of a content tree: properties plus named children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, ContentNode>,
}

impl ContentNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Builder-style child setter.
    pub fn with_child(mut self, name: impl Into<String>, child: ContentNode) -> Self {
        self.children.insert(name.into(), child);
        self
    }

    /// Number of nodes in this subtree, including self.
    pub fn node_count(&self) -> usize {
        1 + self.children.values().map(ContentNode::node_count).sum::<usize>()
    }
}

/// Snapshot of one exported subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub node: ContentNode,
}

/// The content change a package carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PackagePayload {
    /// Full subtrees to write at their paths (ADD).
    Snapshot { entries: Vec<SnapshotEntry> },
    /// Remove the package paths (DELETE).
    Deletion,
    /// No change (TEST).
    Empty,
}

/// Immutable unit of transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionPackage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DistributionRequestType,
    pub paths: Vec<String>,
    pub payload: PackagePayload,
    pub created_at: DateTime<Utc>,
    /// SHA-256 (hex) over type, paths and payload. See [`package_checksum`].
    pub checksum: String,
}

impl DistributionPackage {
    /// Build a package with a fresh id and computed checksum.
    pub fn new(
        kind: DistributionRequestType,
        paths: Vec<String>,
        payload: PackagePayload,
    ) -> Result<Self> {
        let checksum = package_checksum(kind, &paths, &payload)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            paths,
            payload,
            created_at: Utc::now(),
            checksum,
        })
    }

    /// Check the stored checksum against the payload.
    pub fn verify(&self) -> Result<()> {
        let actual = package_checksum(self.kind, &self.paths, &self.payload)?;
        if actual != self.checksum {
            return Err(DistributionError::MalformedPackage(format!(
                "checksum mismatch for package {}: expected {}, got {}",
                self.id, self.checksum, actual
            )));
        }
        Ok(())
    }

    /// Encode to wire bytes, compressing large envelopes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| DistributionError::Internal(format!("package encode: {}", e)))?;
        if json.len() <= COMPRESSION_THRESHOLD {
            return Ok(json);
        }
        zstd::encode_all(&json[..], ZSTD_LEVEL)
            .map_err(|e| DistributionError::Internal(format!("zstd encode: {}", e)))
    }

    /// Decode wire bytes and validate the checksum.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let json = maybe_decompress(data)?;
        let package: DistributionPackage = serde_json::from_slice(&json)
            .map_err(|e| DistributionError::MalformedPackage(format!("package decode: {}", e)))?;
        package.verify()?;
        Ok(package)
    }

    /// Number of content nodes the payload carries.
    pub fn node_count(&self) -> usize {
        match &self.payload {
            PackagePayload::Snapshot { entries } => entries.iter().map(|e| e.node.node_count()).sum(),
            PackagePayload::Deletion | PackagePayload::Empty => 0,
        }
    }
}

/// Whether wire bytes carry the zstd magic header.
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if is_compressed(data) {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| DistributionError::MalformedPackage(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| DistributionError::MalformedPackage(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// The fields a package checksum covers, in canonical order.
#[derive(Serialize)]
struct ChecksumInput<'a> {
    kind: DistributionRequestType,
    paths: &'a [String],
    payload: &'a PackagePayload,
}

/// SHA-256 (hex) of the canonical JSON of a package's type, paths and payload.
pub fn package_checksum(
    kind: DistributionRequestType,
    paths: &[String],
    payload: &PackagePayload,
) -> Result<String> {
    use sha2::{Digest, Sha256};
    let canonical = serde_json::to_vec(&ChecksumInput { kind, paths, payload })
        .map_err(|e| DistributionError::Internal(format!("checksum encode: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
