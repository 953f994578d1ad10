use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sandfs_delta::ChangeKind;
use sandfs_delta::DeltaStore;
use sandfs_fs::SandboxFilesystem;
use sandfs_permissions::PermissionEngine;
use sandfs_protocol::PermissionRule;
use sandfs_protocol::SandboxError;
use sandfs_protocol::SandboxId;
use sandfs_protocol::SandboxRecord;
use sandfs_protocol::SandboxResult;
use sandfs_protocol::SandboxStatus;
use sandfs_protocol::SessionId;
use sandfs_protocol::SessionRecord;
use sandfs_session::ExecOutcome;
use sandfs_session::Session;
use sandfs_utils_absolute_path::AbsolutePathBuf;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::warn;

struct SandboxEntry {
    record: SandboxRecord,
    /// Live only while `record.status == Running`; the filesystem adapter
    /// itself is consumed by the mount, so this is the one handle the
    /// manager keeps back for `update_rules`.
    permissions: Option<Arc<PermissionEngine>>,
    mount: Option<sandfs_mount::ReadyHandle>,
    session_ids: Vec<SessionId>,
}

struct SessionEntry {
    sandbox_id: SandboxId,
    #[allow(dead_code)]
    record: SessionRecord,
    session: Mutex<Session>,
}

/// Owns every sandbox and session the process knows about. One instance is
/// meant to be shared (behind an `Arc`) across whatever RPC surface drives
/// it; every method here is already safe to call concurrently.
pub struct SandboxManager {
    delta_root: AbsolutePathBuf,
    sandboxes: RwLock<HashMap<SandboxId, SandboxEntry>>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SandboxManager {
    /// `delta_root` is the directory under which each sandbox gets its own
    /// `<delta_root>/<id>` overlay directory.
    pub fn new(delta_root: AbsolutePathBuf) -> Self {
        Self {
            delta_root,
            sandboxes: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_sandbox(
        &self,
        source_dir: AbsolutePathBuf,
        rules: Vec<PermissionRule>,
        mountpoint: AbsolutePathBuf,
        labels: BTreeMap<String, String>,
    ) -> SandboxResult<SandboxRecord> {
        let id = SandboxId::new();
        let delta_dir = self.delta_root.join(id.to_string())?;
        let record = SandboxRecord::new(id, source_dir, delta_dir, mountpoint, rules, labels);

        let mut sandboxes = self.sandboxes.write().await;
        sandboxes.insert(
            id,
            SandboxEntry {
                record: record.clone(),
                permissions: None,
                mount: None,
                session_ids: Vec::new(),
            },
        );
        Ok(record)
    }

    pub async fn start(&self, id: SandboxId) -> SandboxResult<()> {
        let mut sandboxes = self.sandboxes.write().await;
        let entry = sandboxes
            .get_mut(&id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        if matches!(
            entry.record.status,
            SandboxStatus::Running | SandboxStatus::Destroyed
        ) {
            return Err(SandboxError::InvalidState {
                current: entry.record.status,
                attempted: "start",
            });
        }

        let source_dir = entry.record.source_dir.clone();
        let delta_dir = entry.record.delta_dir.clone();
        let mountpoint = entry.record.mountpoint.clone();
        let rules = entry.record.rules.clone();

        if let Err(err) = tokio::fs::create_dir_all(delta_dir.as_path()).await {
            entry.record.status = SandboxStatus::Error;
            return Err(SandboxError::Io(err));
        }

        let delta = match DeltaStore::new(source_dir, delta_dir.clone()) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(delta_dir.as_path()).await;
                entry.record.status = SandboxStatus::Error;
                return Err(err);
            }
        };
        let permissions = Arc::new(PermissionEngine::new(rules));
        let filesystem = SandboxFilesystem::new(permissions.clone(), delta);

        match sandfs_mount::mount(filesystem, mountpoint.as_path()).await {
            Ok(handle) => {
                entry.record.status = SandboxStatus::Running;
                entry.record.started_at = Some(Utc::now());
                entry.permissions = Some(permissions);
                entry.mount = Some(handle);
                Ok(())
            }
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(delta_dir.as_path()).await;
                let _ = tokio::fs::remove_dir_all(mountpoint.as_path()).await;
                entry.record.status = SandboxStatus::Error;
                Err(err)
            }
        }
    }

    pub async fn stop(&self, id: SandboxId) -> SandboxResult<()> {
        let mut sandboxes = self.sandboxes.write().await;
        let entry = sandboxes
            .get_mut(&id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        if !matches!(entry.record.status, SandboxStatus::Running) {
            return Err(SandboxError::InvalidState {
                current: entry.record.status,
                attempted: "stop",
            });
        }
        self.stop_entry(entry).await;
        Ok(())
    }

    pub async fn destroy(&self, id: SandboxId) -> SandboxResult<()> {
        let mut sandboxes = self.sandboxes.write().await;
        let entry = sandboxes
            .get_mut(&id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;

        if matches!(entry.record.status, SandboxStatus::Destroyed) {
            return Ok(());
        }
        if matches!(entry.record.status, SandboxStatus::Running) {
            self.stop_entry(entry).await;
        }

        if let Err(err) = tokio::fs::remove_dir_all(entry.record.delta_dir.as_path()).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox_id = %id, %err, "failed to remove delta directory during destroy");
            }
        }
        entry.record.status = SandboxStatus::Destroyed;
        Ok(())
    }

    /// Cleanup invariant shared by `stop` and `destroy`: sessions closed,
    /// mount unmounted, mountpoint directory removed, in that order.
    /// Errors at each step are logged, never allowed to skip the rest.
    async fn stop_entry(&self, entry: &mut SandboxEntry) {
        let owned_sessions = std::mem::take(&mut entry.session_ids);
        if !owned_sessions.is_empty() {
            let mut sessions = self.sessions.write().await;
            for session_id in owned_sessions {
                if let Some(session_entry) = sessions.remove(&session_id) {
                    let session = session_entry.session.into_inner();
                    if let Err(err) = session.close().await {
                        warn!(%session_id, %err, "failed to close session during sandbox stop");
                    }
                }
            }
        }

        if let Some(handle) = entry.mount.take() {
            if let Err(err) = sandfs_mount::unmount(handle).await {
                warn!(sandbox_id = %entry.record.id, %err, "unmount failed during sandbox stop");
            }
        }

        if let Err(err) = tokio::fs::remove_dir_all(entry.record.mountpoint.as_path()).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox_id = %entry.record.id, %err, "failed to remove mountpoint during sandbox stop");
            }
        }

        entry.permissions = None;
        entry.record.status = SandboxStatus::Stopped;
        entry.record.stopped_at = Some(Utc::now());
    }

    pub async fn open_session(
        &self,
        id: SandboxId,
        shell: Option<PathBuf>,
        env: BTreeMap<String, String>,
    ) -> SandboxResult<SessionId> {
        let mountpoint = {
            let sandboxes = self.sandboxes.read().await;
            let entry = sandboxes
                .get(&id)
                .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
            if !matches!(entry.record.status, SandboxStatus::Running) {
                return Err(SandboxError::InvalidState {
                    current: entry.record.status,
                    attempted: "open_session",
                });
            }
            entry.record.mountpoint.clone()
        };

        let shell_path =
            shell.unwrap_or_else(|| PathBuf::from(sandfs_session::DEFAULT_SHELL));
        let session = Session::spawn(&shell_path, mountpoint.as_path(), env.clone()).await?;
        let record = SessionRecord::new(id, shell_path, env);
        let session_id = record.id;

        self.sessions.write().await.insert(
            session_id,
            SessionEntry {
                sandbox_id: id,
                record,
                session: Mutex::new(session),
            },
        );

        let mut sandboxes = self.sandboxes.write().await;
        if let Some(entry) = sandboxes.get_mut(&id) {
            entry.session_ids.push(session_id);
        }

        Ok(session_id)
    }

    pub async fn session_exec(
        &self,
        session_id: SessionId,
        cmd: &str,
        stdin: Option<&[u8]>,
        env_overrides: BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> SandboxResult<ExecOutcome> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(&session_id)
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?;
        let mut session = entry.session.lock().await;
        session.exec(cmd, stdin, env_overrides, timeout).await
    }

    pub async fn close_session(&self, session_id: SessionId) -> SandboxResult<()> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(&session_id)
                .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?
        };

        let mut sandboxes = self.sandboxes.write().await;
        if let Some(sandbox_entry) = sandboxes.get_mut(&entry.sandbox_id) {
            sandbox_entry.session_ids.retain(|existing| *existing != session_id);
        }
        drop(sandboxes);

        entry.session.into_inner().close().await
    }

    pub async fn exec(
        &self,
        id: SandboxId,
        cmd: &str,
        stdin: Option<&[u8]>,
        env: BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> SandboxResult<ExecOutcome> {
        let mountpoint = {
            let sandboxes = self.sandboxes.read().await;
            let entry = sandboxes
                .get(&id)
                .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
            if !matches!(entry.record.status, SandboxStatus::Running) {
                return Err(SandboxError::InvalidState {
                    current: entry.record.status,
                    attempted: "exec",
                });
            }
            entry.record.mountpoint.clone()
        };

        sandfs_session::exec_once(
            Path::new(sandfs_session::DEFAULT_SHELL),
            mountpoint.as_path(),
            env,
            cmd,
            stdin,
            timeout,
        )
        .await
    }

    pub async fn update_rules(&self, id: SandboxId, rules: Vec<PermissionRule>) -> SandboxResult<()> {
        let mut sandboxes = self.sandboxes.write().await;
        let entry = sandboxes
            .get_mut(&id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        if let Some(permissions) = &entry.permissions {
            permissions.update_rules(rules.clone());
        }
        entry.record.rules = rules;
        Ok(())
    }

    pub async fn sync_delta(&self, id: SandboxId) -> SandboxResult<()> {
        self.delta_store_for(id).await?.sync_to_source()
    }

    pub async fn list_delta_changes(&self, id: SandboxId) -> SandboxResult<Vec<ChangeKind>> {
        self.delta_store_for(id).await?.list_changes()
    }

    pub async fn clear_delta(&self, id: SandboxId) -> SandboxResult<()> {
        self.delta_store_for(id).await?.clear()
    }

    /// Builds a standalone handle onto a sandbox's overlay directory. This
    /// is intentionally independent of the `Arc<DeltaStore>` a running
    /// mount may hold: sync/list/clear are data-plane operations on the
    /// same on-disk tree, valid whether or not the sandbox is mounted.
    async fn delta_store_for(&self, id: SandboxId) -> SandboxResult<DeltaStore> {
        let sandboxes = self.sandboxes.read().await;
        let entry = sandboxes
            .get(&id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        DeltaStore::new(entry.record.source_dir.clone(), entry.record.delta_dir.clone())
    }

    pub async fn get_sandbox(&self, id: SandboxId) -> SandboxResult<SandboxRecord> {
        let sandboxes = self.sandboxes.read().await;
        sandboxes
            .get(&id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    pub async fn list_sandboxes(&self) -> Vec<SandboxRecord> {
        let sandboxes = self.sandboxes.read().await;
        sandboxes.values().map(|entry| entry.record.clone()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sandfs_protocol::PatternKind;
    use sandfs_protocol::PermissionLevel;

    fn manager(tempdir: &tempfile::TempDir) -> SandboxManager {
        let delta_root = tempdir.path().join("deltas");
        std::fs::create_dir_all(&delta_root).unwrap();
        SandboxManager::new(AbsolutePathBuf::from_absolute_path(&delta_root).unwrap())
    }

    async fn new_record(
        manager: &SandboxManager,
        tempdir: &tempfile::TempDir,
        name: &str,
    ) -> SandboxRecord {
        let source_dir = tempdir.path().join(format!("{name}-source"));
        let mountpoint = tempdir.path().join(format!("{name}-mnt"));
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::create_dir_all(&mountpoint).unwrap();
        manager
            .create_sandbox(
                AbsolutePathBuf::from_absolute_path(&source_dir).unwrap(),
                vec![PermissionRule::new("/**/*", PatternKind::Glob, PermissionLevel::Read)],
                AbsolutePathBuf::from_absolute_path(&mountpoint).unwrap(),
                BTreeMap::new(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_sandbox_starts_pending() {
        let tempdir = tempfile::tempdir().unwrap();
        let manager = manager(&tempdir);
        let record = new_record(&manager, &tempdir, "a").await;
        assert_eq!(record.status, SandboxStatus::Pending);
        assert!(record.delta_dir.as_path().starts_with(tempdir.path()));
    }

    #[tokio::test]
    async fn get_sandbox_and_list_sandboxes_reflect_created_records() {
        let tempdir = tempfile::tempdir().unwrap();
        let manager = manager(&tempdir);
        let record = new_record(&manager, &tempdir, "a").await;

        let fetched = manager.get_sandbox(record.id).await.unwrap();
        assert_eq!(fetched.id, record.id);
        assert_eq!(manager.list_sandboxes().await.len(), 1);
    }

    #[tokio::test]
    async fn get_sandbox_on_unknown_id_is_not_found() {
        let tempdir = tempfile::tempdir().unwrap();
        let manager = manager(&tempdir);
        let err = manager.get_sandbox(SandboxId::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_on_a_pending_sandbox_is_invalid_state() {
        let tempdir = tempfile::tempdir().unwrap();
        let manager = manager(&tempdir);
        let record = new_record(&manager, &tempdir, "a").await;
        let err = manager.stop(record.id).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn open_session_on_a_non_running_sandbox_is_invalid_state() {
        let tempdir = tempfile::tempdir().unwrap();
        let manager = manager(&tempdir);
        let record = new_record(&manager, &tempdir, "a").await;
        let err = manager
            .open_session(record.id, None, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn update_rules_persists_on_a_stopped_sandbox_without_a_live_engine() {
        let tempdir = tempfile::tempdir().unwrap();
        let manager = manager(&tempdir);
        let record = new_record(&manager, &tempdir, "a").await;

        let new_rules = vec![PermissionRule::new("/**/*", PatternKind::Glob, PermissionLevel::Write)];
        manager.update_rules(record.id, new_rules.clone()).await.unwrap();

        let fetched = manager.get_sandbox(record.id).await.unwrap();
        assert_eq!(fetched.rules, new_rules);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_removes_the_delta_directory() {
        let tempdir = tempfile::tempdir().unwrap();
        let manager = manager(&tempdir);
        let record = new_record(&manager, &tempdir, "a").await;
        tokio::fs::create_dir_all(record.delta_dir.as_path()).await.unwrap();

        manager.destroy(record.id).await.unwrap();
        assert!(!record.delta_dir.as_path().exists());
        let fetched = manager.get_sandbox(record.id).await.unwrap();
        assert_eq!(fetched.status, SandboxStatus::Destroyed);

        manager.destroy(record.id).await.unwrap();
    }

    #[tokio::test]
    async fn destroy_on_unknown_id_is_not_found() {
        let tempdir = tempfile::tempdir().unwrap();
        let manager = manager(&tempdir);
        let err = manager.destroy(SandboxId::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    /// Exercises the full create -> start -> exec -> stop -> destroy path
    /// through a real FUSE mount. Needs `/dev/fuse` and permission to
    /// mount, which most sandboxed build environments do not grant.
    #[tokio::test]
    #[ignore = "requires a real FUSE mount (/dev/fuse + mount permission)"]
    async fn full_lifecycle_through_a_real_mount() {
        let tempdir = tempfile::tempdir().unwrap();
        let manager = manager(&tempdir);
        let source_dir = tempdir.path().join("source");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(source_dir.join("f"), b"x").unwrap();
        let mountpoint = tempdir.path().join("mnt");
        std::fs::create_dir_all(&mountpoint).unwrap();

        let record = manager
            .create_sandbox(
                AbsolutePathBuf::from_absolute_path(&source_dir).unwrap(),
                vec![PermissionRule::new("/**/*", PatternKind::Glob, PermissionLevel::Write)],
                AbsolutePathBuf::from_absolute_path(&mountpoint).unwrap(),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        manager.start(record.id).await.unwrap();

        let outcome = manager
            .exec(record.id, "cat f", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, b"x");

        manager.stop(record.id).await.unwrap();
        assert!(!mountpoint.exists());

        manager.destroy(record.id).await.unwrap();
        assert!(!record.delta_dir.as_path().exists());
    }
}
