use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::RwLock;

use sandfs_protocol::SandboxError;
use sandfs_protocol::SandboxResult;
use sandfs_utils_absolute_path::AbsolutePathBuf;
use walkdir::WalkDir;

use crate::basename;
use crate::components;
use crate::parent_relpath;
use crate::strip_whiteout_prefix;
use crate::whiteout_name;

/// Where a resolved path's bytes actually live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Delta,
    Source,
}

/// Outcome of resolving a sandbox-relative path against the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Present(AbsolutePathBuf, Origin),
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Modified(String),
    Deleted(String),
}

fn file_type_kind(file_type: fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

/// Per-sandbox copy-on-write store over `(source_dir, delta_dir)`.
///
/// A `std::sync::RwLock` backs the concurrency discipline the overlay
/// promises: readers (`resolve`, `merged_readdir`, `has_delta`, `is_deleted`,
/// `list_changes`) take the shared lock, writers that change layout
/// (`copy_to_delta`, `mark_deleted`, `remove_whiteout`, `sync_to_source`,
/// `clear`) take the exclusive lock.
#[derive(Debug)]
pub struct DeltaStore {
    source_dir: AbsolutePathBuf,
    delta_dir: AbsolutePathBuf,
    lock: RwLock<()>,
}

impl DeltaStore {
    pub fn new(source_dir: AbsolutePathBuf, delta_dir: AbsolutePathBuf) -> SandboxResult<Self> {
        if !source_dir.as_path().is_dir() {
            return Err(SandboxError::invalid(
                "source_dir",
                format!("{} does not exist or is not a directory", source_dir.display()),
            ));
        }
        fs::create_dir_all(delta_dir.as_path())?;
        Ok(Self {
            source_dir,
            delta_dir,
            lock: RwLock::new(()),
        })
    }

    pub fn source_dir(&self) -> &AbsolutePathBuf {
        &self.source_dir
    }

    pub fn delta_dir(&self) -> &AbsolutePathBuf {
        &self.delta_dir
    }

    fn source_path(&self, relpath: &str) -> PathBuf {
        join_components(self.source_dir.as_path(), relpath)
    }

    fn delta_path(&self, relpath: &str) -> PathBuf {
        join_components(self.delta_dir.as_path(), relpath)
    }

    fn whiteout_path(&self, relpath: &str) -> PathBuf {
        let parent = parent_relpath(relpath);
        join_components(self.delta_dir.as_path(), &parent).join(whiteout_name(basename(relpath)))
    }

    /// The path an entry at `relpath` would occupy in the overlay, whether
    /// or not anything is there yet. Used by callers (the filesystem
    /// adapter) that need to open a just-created or just-promoted entry
    /// directly.
    pub fn delta_entry_path(&self, relpath: &str) -> PathBuf {
        self.delta_path(relpath)
    }

    /// Creates a new regular file directly in the delta, clearing any
    /// whiteout at `relpath` first. Fails if an entry already exists there.
    pub fn create_file(&self, relpath: &str, mode: u32) -> SandboxResult<PathBuf> {
        let _guard = write_lock(&self.lock);
        self.remove_whiteout_impl(relpath)?;
        let parent = parent_relpath(relpath);
        fs::create_dir_all(join_components(self.delta_dir.as_path(), &parent))?;
        let path = self.delta_path(relpath);
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(path)
    }

    /// Creates a new directory directly in the delta, clearing any whiteout
    /// at `relpath` first.
    pub fn create_dir(&self, relpath: &str, mode: u32) -> SandboxResult<PathBuf> {
        let _guard = write_lock(&self.lock);
        self.remove_whiteout_impl(relpath)?;
        let path = self.delta_path(relpath);
        fs::create_dir_all(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(path)
    }

    /// Creates a symlink directly in the delta, clearing any whiteout at
    /// `relpath` first and replacing any present entry there.
    pub fn create_symlink(&self, relpath: &str, target: &Path) -> SandboxResult<PathBuf> {
        let _guard = write_lock(&self.lock);
        self.remove_whiteout_impl(relpath)?;
        let parent = parent_relpath(relpath);
        fs::create_dir_all(join_components(self.delta_dir.as_path(), &parent))?;
        let path = self.delta_path(relpath);
        if path.symlink_metadata().is_ok() {
            fs::remove_file(&path)?;
        }
        std::os::unix::fs::symlink(target, &path)?;
        Ok(path)
    }

    pub fn has_delta(&self, relpath: &str) -> bool {
        let _guard = read_lock(&self.lock);
        self.delta_path(relpath).symlink_metadata().is_ok()
    }

    /// True if `relpath` or any ancestor directory is hidden by a whiteout.
    pub fn is_deleted(&self, relpath: &str) -> bool {
        let _guard = read_lock(&self.lock);
        self.is_deleted_locked(relpath)
    }

    fn is_deleted_locked(&self, relpath: &str) -> bool {
        let comps = components(relpath);
        let mut prefix = String::new();
        for name in comps {
            let parent_dir = join_components(self.delta_dir.as_path(), &prefix);
            if parent_dir.join(whiteout_name(name)).symlink_metadata().is_ok() {
                return true;
            }
            if prefix.is_empty() {
                prefix = name.to_string();
            } else {
                prefix = format!("{prefix}/{name}");
            }
        }
        false
    }

    pub fn resolve(&self, relpath: &str) -> SandboxResult<Resolution> {
        let _guard = read_lock(&self.lock);
        if self.is_deleted_locked(relpath) {
            return Ok(Resolution::Deleted);
        }
        let delta_path = self.delta_path(relpath);
        if delta_path.symlink_metadata().is_ok() {
            let absolute = AbsolutePathBuf::from_absolute_path(&delta_path)?;
            return Ok(Resolution::Present(absolute, Origin::Delta));
        }
        let source_path = self.source_path(relpath);
        if source_path.symlink_metadata().is_ok() {
            let absolute = AbsolutePathBuf::from_absolute_path(&source_path)?;
            return Ok(Resolution::Present(absolute, Origin::Source));
        }
        Ok(Resolution::NotFound)
    }

    /// Idempotent promotion: if the delta already has `relpath`, no-op; if
    /// only source has it, recursively copies source → delta, preserving
    /// file contents, symlink targets, and directory mode. A non-existent
    /// source is a no-op (used to "touch" write intent ahead of create).
    pub fn copy_to_delta(&self, relpath: &str) -> SandboxResult<()> {
        let _guard = write_lock(&self.lock);
        self.copy_to_delta_impl(relpath)
    }

    fn copy_to_delta_impl(&self, relpath: &str) -> SandboxResult<()> {
        if self.delta_path(relpath).symlink_metadata().is_ok() {
            return Ok(());
        }
        let source_root = self.source_path(relpath);
        if source_root.symlink_metadata().is_err() {
            return Ok(());
        }

        let parent = parent_relpath(relpath);
        fs::create_dir_all(join_components(self.delta_dir.as_path(), &parent))?;

        for entry in WalkDir::new(&source_root).into_iter() {
            let entry = entry.map_err(|e| io_error_from_walkdir(&source_root, e))?;
            let rel_to_root = entry
                .path()
                .strip_prefix(&source_root)
                .unwrap_or_else(|_| Path::new(""));
            let dest = self.delta_dir.as_path().join(relative_join(relpath, rel_to_root));
            copy_one(entry.path(), &dest)?;
        }
        Ok(())
    }

    /// Ensures the parent delta directory exists, removes any delta entry at
    /// `relpath`, then writes a whiteout marker in the parent directory.
    pub fn mark_deleted(&self, relpath: &str) -> SandboxResult<()> {
        let _guard = write_lock(&self.lock);
        self.mark_deleted_impl(relpath)
    }

    fn mark_deleted_impl(&self, relpath: &str) -> SandboxResult<()> {
        let parent = parent_relpath(relpath);
        fs::create_dir_all(join_components(self.delta_dir.as_path(), &parent))?;

        let entry_path = self.delta_path(relpath);
        match entry_path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&entry_path)?,
            Ok(_) => fs::remove_file(&entry_path)?,
            Err(_) => {}
        }

        fs::write(self.whiteout_path(relpath), b"")?;
        Ok(())
    }

    pub fn remove_whiteout(&self, relpath: &str) -> SandboxResult<()> {
        let _guard = write_lock(&self.lock);
        self.remove_whiteout_impl(relpath)
    }

    fn remove_whiteout_impl(&self, relpath: &str) -> SandboxResult<()> {
        let path = self.whiteout_path(relpath);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves `from` to `to` within the overlay. If `from` lives only in
    /// source, it is promoted to the delta first. If source holds a
    /// counterpart at `from`, a whiteout is left behind there so the merged
    /// view doesn't resurrect the source copy; otherwise any stale whiteout
    /// at `from` is irrelevant (nothing to hide). Any whiteout sitting at
    /// `to` is cleared since the destination now has a present entry.
    pub fn rename(&self, from: &str, to: &str) -> SandboxResult<()> {
        let _guard = write_lock(&self.lock);
        if self.is_deleted_locked(from) {
            return Err(SandboxError::NotFound(from.to_string()));
        }
        let from_in_delta = self.delta_path(from).symlink_metadata().is_ok();
        let from_in_source = self.source_path(from).symlink_metadata().is_ok();
        if !from_in_delta && !from_in_source {
            return Err(SandboxError::NotFound(from.to_string()));
        }

        let to_parent = parent_relpath(to);
        fs::create_dir_all(join_components(self.delta_dir.as_path(), &to_parent))?;
        if !from_in_delta {
            self.copy_to_delta_impl(from)?;
        }

        let from_delta = self.delta_path(from);
        let to_delta = self.delta_path(to);
        if let Ok(meta) = to_delta.symlink_metadata() {
            if meta.is_dir() {
                fs::remove_dir_all(&to_delta)?;
            } else {
                fs::remove_file(&to_delta)?;
            }
        }
        fs::rename(&from_delta, &to_delta)?;

        if from_in_source {
            self.mark_deleted_impl(from)?;
        }
        self.remove_whiteout_impl(to)?;
        Ok(())
    }

    /// Enumerates the merged contents of a directory: source entries and
    /// delta entries unioned by name (delta wins), minus names hidden by a
    /// sibling whiteout, minus whiteout markers themselves. Never mutates
    /// either directory. Callers are responsible for checking that the
    /// directory itself is not deleted before calling this.
    pub fn merged_readdir(&self, relpath: &str) -> SandboxResult<Vec<DirEntry>> {
        let _guard = read_lock(&self.lock);
        let mut merged: std::collections::BTreeMap<String, EntryKind> =
            std::collections::BTreeMap::new();

        let source_dir = self.source_path(relpath);
        if let Ok(read_dir) = fs::read_dir(&source_dir) {
            for entry in read_dir {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let file_type = entry.file_type()?;
                merged.insert(name, file_type_kind(file_type));
            }
        }

        let mut whiteouts = std::collections::HashSet::new();
        let delta_dir = self.delta_path(relpath);
        if let Ok(read_dir) = fs::read_dir(&delta_dir) {
            for entry in read_dir {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(hidden) = strip_whiteout_prefix(&name) {
                    whiteouts.insert(hidden.to_string());
                    continue;
                }
                let file_type = entry.file_type()?;
                merged.insert(name, file_type_kind(file_type));
            }
        }

        for hidden in &whiteouts {
            merged.remove(hidden);
        }

        Ok(merged
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    /// Lists every delta entry as `Modified(path)` or, for whiteout markers,
    /// `Deleted(path)` (with the marker's own name stripped of its prefix).
    pub fn list_changes(&self) -> SandboxResult<Vec<ChangeKind>> {
        let _guard = read_lock(&self.lock);
        let mut changes = Vec::new();
        for entry in WalkDir::new(self.delta_dir.as_path())
            .min_depth(1)
            .into_iter()
        {
            let entry = entry.map_err(|e| io_error_from_walkdir(self.delta_dir.as_path(), e))?;
            let rel = entry
                .path()
                .strip_prefix(self.delta_dir.as_path())
                .unwrap_or_else(|_| Path::new(""));
            let rel_str = path_to_relpath(rel);
            let name = entry.file_name().to_string_lossy();
            match strip_whiteout_prefix(&name) {
                Some(hidden) => {
                    let parent = parent_relpath(&rel_str);
                    let hidden_path = if parent.is_empty() {
                        format!("/{hidden}")
                    } else {
                        format!("/{parent}/{hidden}")
                    };
                    changes.push(ChangeKind::Deleted(hidden_path));
                }
                None => changes.push(ChangeKind::Modified(format!("/{rel_str}"))),
            }
        }
        Ok(changes)
    }

    /// Applies every delta entry onto source (last-writer-wins): whiteouts
    /// delete, directories are ensured, symlinks are replaced, regular
    /// files are written via write-then-rename. Not atomic across the whole
    /// tree, but each file is replaced crash-safely.
    pub fn sync_to_source(&self) -> SandboxResult<()> {
        let _guard = write_lock(&self.lock);
        for entry in WalkDir::new(self.delta_dir.as_path())
            .min_depth(1)
            .into_iter()
        {
            let entry = entry.map_err(|e| io_error_from_walkdir(self.delta_dir.as_path(), e))?;
            let rel = entry
                .path()
                .strip_prefix(self.delta_dir.as_path())
                .unwrap_or_else(|_| Path::new(""));
            let rel_str = path_to_relpath(rel);
            let name = entry.file_name().to_string_lossy();

            if let Some(hidden) = strip_whiteout_prefix(&name) {
                let parent = parent_relpath(&rel_str);
                let target = join_components(self.source_dir.as_path(), &parent).join(hidden);
                match target.symlink_metadata() {
                    Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target)?,
                    Ok(_) => fs::remove_file(&target)?,
                    Err(_) => {}
                }
                continue;
            }

            let dest = self.source_dir.as_path().join(&rel);
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                fs::create_dir_all(&dest)?;
            } else if file_type.is_symlink() {
                let link_target = fs::read_link(entry.path())?;
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest)?;
                }
                std::os::unix::fs::symlink(&link_target, &dest)?;
            } else {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                let tmp = dest.with_file_name(format!(
                    ".{}.sandfs-sync",
                    dest.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                ));
                fs::copy(entry.path(), &tmp)?;
                fs::rename(&tmp, &dest)?;
            }
        }
        Ok(())
    }

    /// Removes all delta content; the delta directory itself remains.
    pub fn clear(&self) -> SandboxResult<()> {
        let _guard = write_lock(&self.lock);
        for entry in fs::read_dir(self.delta_dir.as_path())? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

fn read_lock(lock: &RwLock<()>) -> std::sync::RwLockReadGuard<'_, ()> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock(lock: &RwLock<()>) -> std::sync::RwLockWriteGuard<'_, ()> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn join_components(base: &Path, relpath: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for comp in components(relpath) {
        path.push(comp);
    }
    path
}

fn relative_join(relpath: &str, suffix: &Path) -> PathBuf {
    let mut path = PathBuf::new();
    for comp in components(relpath) {
        path.push(comp);
    }
    path.push(suffix);
    path
}

fn path_to_relpath(path: &Path) -> String {
    path.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/")
}

fn copy_one(src: &Path, dest: &Path) -> SandboxResult<()> {
    let meta = src.symlink_metadata()?;
    if meta.is_dir() {
        fs::create_dir_all(dest)?;
        fs::set_permissions(dest, meta.permissions())?;
    } else if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(dest)?;
        }
        std::os::unix::fs::symlink(&target, dest)?;
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dest)?;
        let mut perms = fs::metadata(dest)?.permissions();
        perms.set_mode(meta.permissions().mode());
        fs::set_permissions(dest, perms)?;
    }
    Ok(())
}

fn io_error_from_walkdir(root: &Path, err: walkdir::Error) -> SandboxError {
    SandboxError::Io(std::io::Error::other(format!(
        "walking {}: {err}",
        root.display()
    )))
}
