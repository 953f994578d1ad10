use chrono::DateTime;
use chrono::Utc;
use sandfs_utils_absolute_path::AbsolutePathBuf;
use serde::Deserialize;
use serde::Serialize;

use crate::PermissionRule;
use crate::SandboxId;

/// Lifecycle state of a [`SandboxRecord`]. See the sandbox lifecycle state
/// machine: `Pending -> Running <-> Stopped -> Destroyed`, with `Error`
/// reachable from `Running` on an unrecoverable fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopped,
    Destroyed,
    Error,
}

/// A sandbox's durable metadata: what it mounts, from where, under which
/// rules, and what state it is in. Owned exclusively by the lifecycle
/// manager; the filesystem adapter only borrows `rules` for the life of the
/// mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: SandboxId,
    pub source_dir: AbsolutePathBuf,
    pub delta_dir: AbsolutePathBuf,
    pub mountpoint: AbsolutePathBuf,
    pub status: SandboxStatus,
    pub rules: Vec<PermissionRule>,
    pub labels: std::collections::BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl SandboxRecord {
    pub fn new(
        id: SandboxId,
        source_dir: AbsolutePathBuf,
        delta_dir: AbsolutePathBuf,
        mountpoint: AbsolutePathBuf,
        rules: Vec<PermissionRule>,
        labels: std::collections::BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            source_dir,
            delta_dir,
            mountpoint,
            status: SandboxStatus::Pending,
            rules,
            labels,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }
}
