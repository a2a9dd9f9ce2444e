//! Manifest and reply shapes exchanged on the deploy channel.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{CourierError, Result};

/// Hex SHA-256 of `content`.
pub fn hash_content(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// One file offered to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub hash: String,
    pub size: u64,
}

impl ManifestEntry {
    pub fn from_content(path: impl Into<String>, content: &[u8]) -> Self {
        Self {
            path: path.into(),
            hash: hash_content(content),
            size: content.len() as u64,
        }
    }

    /// Metadata sent in front of the file bytes on upload.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("path".to_string(), self.path.clone()),
            ("hash".to_string(), self.hash.clone()),
            ("size".to_string(), self.size.to_string()),
        ])
    }
}

/// Target version plus every file that makes it up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            files: Vec::new(),
        }
    }

    pub fn add(&mut self, entry: ManifestEntry) {
        self.files.push(entry);
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub(crate) fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ManifestReply {
    #[serde(default)]
    pub need_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeployReply {
    pub version: String,
    #[serde(default)]
    pub file_count: u64,
}

/// Outcome of the optional install step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub version: String,
}

/// Outcome of a whole deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployResult {
    pub version: String,
    pub file_count: u64,
    /// Paths the server asked for and received, sorted
    pub uploaded: Vec<String>,
    pub install: Option<InstallResult>,
}

/// Read a reply body into `T`. A `null` response counts as an empty object.
pub(crate) fn parse_reply<T: DeserializeOwned>(event: &str, response: Value) -> Result<T> {
    let response = match response {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(response)
        .map_err(|e| CourierError::Protocol(format!("unexpected {} reply: {}", event, e)))
}
