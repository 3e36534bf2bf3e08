//! Namespace and override records.

use serde::Deserialize;
use serde::Serialize;

/// Where a counter's authoritative state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sharding {
    /// Each edge location keeps its own counter for the identifier.
    Edge,
    /// One cluster-wide counter (the default behavior).
    Global,
}

impl Sharding {
    /// Parse from the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "edge" => Some(Self::Edge),
            "global" => Some(Self::Global),
            _ => None,
        }
    }

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edge => "edge",
            Self::Global => "global",
        }
    }
}

/// A named counter group inside a workspace.
///
/// Never mutated after creation; deletion is a soft delete. The pair
/// `(workspace_id, name)` is unique among live rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    /// Opaque unique ID.
    pub id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Human-chosen name, e.g. `email.send`.
    pub name: String,
    /// Creation time (Unix ms).
    pub created_at_ms: u64,
    /// Soft-delete time, if deleted.
    pub deleted_at_ms: Option<u64>,
}

impl Namespace {
    /// Build a new namespace with a generated ID.
    pub fn new(workspace_id: impl Into<String>, name: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: format!("ns_{}", uuid::Uuid::new_v4().simple()),
            workspace_id: workspace_id.into(),
            name: name.into(),
            created_at_ms: now_ms,
            deleted_at_ms: None,
        }
    }

    /// Whether the row has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at_ms.is_some()
    }
}

/// Stored policy that supersedes request-supplied limit parameters for an
/// identifier pattern.
///
/// `(namespace_id, identifier)` is unique among live rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatelimitOverride {
    /// Opaque unique ID.
    pub id: String,
    /// Namespace this override belongs to.
    pub namespace_id: String,
    /// Literal identifier or pattern containing `*` wildcards.
    pub identifier: String,
    /// Replacement limit.
    pub limit: u64,
    /// Replacement window duration in milliseconds.
    pub duration_ms: u64,
    /// Replacement async-mode flag.
    pub async_mode: bool,
    /// Optional sharding directive.
    pub sharding: Option<Sharding>,
    /// Creation time (Unix ms).
    pub created_at_ms: u64,
    /// Soft-delete time, if deleted.
    pub deleted_at_ms: Option<u64>,
}

impl RatelimitOverride {
    /// Whether the row has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at_ms.is_some()
    }
}

/// Caller-provided limit parameters used when no override matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDefaults {
    /// Maximum cost admitted per window.
    pub limit: u64,
    /// Window duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the caller asked for the low-latency path.
    pub async_mode: bool,
}

/// The parameters a single limit call runs under after override resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy {
    /// Maximum cost admitted per window.
    pub limit: u64,
    /// Window duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the low-latency path applies.
    pub async_mode: bool,
    /// Sharding directive, if any.
    pub sharding: Option<Sharding>,
    /// ID of the winning override, when one matched.
    pub override_id: Option<String>,
}

impl EffectivePolicy {
    /// Policy from caller defaults (no override matched).
    pub fn from_defaults(defaults: LimitDefaults) -> Self {
        Self {
            limit: defaults.limit,
            duration_ms: defaults.duration_ms,
            async_mode: defaults.async_mode,
            sharding: None,
            override_id: None,
        }
    }

    /// Policy from a winning override.
    pub fn from_override(ov: &RatelimitOverride) -> Self {
        Self {
            limit: ov.limit,
            duration_ms: ov.duration_ms,
            async_mode: ov.async_mode,
            sharding: ov.sharding,
            override_id: Some(ov.id.clone()),
        }
    }
}
