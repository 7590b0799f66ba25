//! Resource versions and the content-addressed scopes that own them.

use crate::ids::{ScopeId, VersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// An opaque key-value version, e.g. `{ref: "abc123"}`.
pub type Version = BTreeMap<String, String>;

/// Resource source configuration.
pub type Source = BTreeMap<String, serde_json::Value>;

/// Step parameters passed through to resource scripts and tasks.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Metadata reported alongside a fetched or produced version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// Hex SHA-256 of the canonical JSON form of `value`.
///
/// Maps are `BTreeMap`s and `serde_json` objects are key-sorted, so the
/// encoding does not depend on insertion order.
pub fn content_hash<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Digest identifying a version within its scope.
pub fn version_digest(version: &Version) -> String {
    content_hash(version)
}

/// The configuration identity under which version history is shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpec {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source: Source,
    /// Version of the custom resource type providing `resource_type`, if any.
    pub type_version: Option<Version>,
}

impl ScopeSpec {
    pub fn new(resource_type: impl Into<String>, source: Source, type_version: Option<Version>) -> Self {
        Self {
            resource_type: resource_type.into(),
            source,
            type_version,
        }
    }

    pub fn id(&self) -> ScopeId {
        ScopeId::new(content_hash(self))
    }
}

/// A scope row: identity plus check bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceScope {
    pub id: ScopeId,
    pub spec: ScopeSpec,
    pub last_check_started: Option<DateTime<Utc>>,
    pub last_check_finished: Option<DateTime<Utc>>,
    pub check_error: Option<String>,
}

/// A discovered version within a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub id: VersionId,
    pub scope_id: ScopeId,
    pub version: Version,
    pub digest: String,
    pub metadata: Vec<MetadataField>,
    /// Discovery sequence within the scope. Higher is newer.
    pub check_order: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}
