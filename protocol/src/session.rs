use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::SandboxId;
use crate::SessionId;

/// Whether a session's shell process is still alive and reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Closed,
}

/// A persistent shell process attached to one running sandbox. Sessions are
/// scoped to their sandbox and are torn down whenever it leaves `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub sandbox_id: SandboxId,
    pub shell_path: PathBuf,
    pub pending_env: BTreeMap<String, String>,
    pub state: SessionState,
}

impl SessionRecord {
    pub fn new(sandbox_id: SandboxId, shell_path: PathBuf, env: BTreeMap<String, String>) -> Self {
        Self {
            id: SessionId::new(),
            sandbox_id,
            shell_path,
            pending_env: env,
            state: SessionState::Open,
        }
    }
}
