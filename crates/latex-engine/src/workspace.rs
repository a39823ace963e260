//! Per-request filesystem workspaces
//!
//! Every compilation gets its own freshly created temporary directory. The
//! manager owns all filesystem side effects of a request: creating the
//! directory, writing the source tree into it and deleting it afterwards.
//!
//! Release is explicit ([`Workspace::release`]) on every normal path; the
//! `Drop` impl is a backstop for cancelled futures.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::compiler::EngineError;

/// Prefix of every workspace directory name
pub const WORKSPACE_PREFIX: &str = "latex-job-";

/// An exclusively owned temporary directory
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    /// Absolute path of the workspace root
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory name, unique per request
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Whether [`release`](Self::release) has already run
    pub fn is_released(&self) -> bool {
        self.dir.is_none()
    }

    /// Recursively delete the workspace.
    ///
    /// Idempotent and infallible: teardown failures are logged, never
    /// returned.
    pub fn release(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => debug!(workspace = %self.path.display(), "Workspace released"),
            Err(e) => warn!(
                workspace = %self.path.display(),
                error = %e,
                "Failed to remove workspace"
            ),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.dir.is_some() {
            debug!(workspace = %self.path.display(), "Workspace dropped without release");
            self.release();
        }
    }
}

/// Creates, fills and tears down workspaces under a fixed root
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, empty workspace with a collision-resistant name
    pub fn acquire(&self) -> Result<Workspace, EngineError> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| {
                EngineError::Resource(format!(
                    "cannot create workspace under {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
        let path = dir.path().to_path_buf();
        debug!(workspace = %path.display(), "Workspace acquired");

        Ok(Workspace {
            dir: Some(dir),
            path,
        })
    }

    /// Write the main document and auxiliary files into `workspace`.
    ///
    /// Relative directory structure is preserved. Any entry resolving outside
    /// the workspace root is an [`EngineError::Input`].
    pub async fn populate(
        &self,
        workspace: &Workspace,
        main_name: &str,
        source: &[u8],
        files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), EngineError> {
        let root = tokio::fs::canonicalize(workspace.path())
            .await
            .map_err(|e| EngineError::Resource(format!("workspace vanished: {}", e)))?;

        write_entry(&root, main_name, source).await?;
        for (name, content) in files {
            write_entry(&root, name, content).await?;
        }

        debug!(
            workspace = %workspace.path().display(),
            files = files.len() + 1,
            "Workspace populated"
        );
        Ok(())
    }

    /// Release `workspace`; see [`Workspace::release`]
    pub fn release(&self, mut workspace: Workspace) {
        workspace.release();
    }
}

/// Normalize a request-supplied relative path.
///
/// Accepts only plain relative components (`.` is dropped). Rejects empty
/// names, NUL bytes, `..`, absolute paths and drive prefixes.
pub fn sanitize_relative_path(name: &str) -> Result<PathBuf, EngineError> {
    if name.is_empty() {
        return Err(EngineError::input("empty file name"));
    }
    if name.contains('\0') {
        return Err(EngineError::input(format!("file name contains NUL: {:?}", name)));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(EngineError::input(format!(
                    "path traversal with '..' is not allowed: {}",
                    name
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(EngineError::input(format!(
                    "absolute paths are not allowed: {}",
                    name
                )))
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(EngineError::input(format!("file name has no components: {}", name)));
    }
    Ok(clean)
}

/// Resolve `name` under `root`, rejecting anything that would land outside it
pub fn resolve_entry(root: &Path, name: &str) -> Result<PathBuf, EngineError> {
    let relative = sanitize_relative_path(name)?;
    let resolved = root.join(relative);
    if !resolved.starts_with(root) {
        return Err(EngineError::input(format!("path escapes workspace: {}", name)));
    }
    Ok(resolved)
}

async fn write_entry(root: &Path, name: &str, content: &[u8]) -> Result<(), EngineError> {
    let target = resolve_entry(root, name)?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::NotADirectory => {
                    EngineError::input(format!("{} clashes with another file entry", name))
                }
                _ => EngineError::Resource(format!("cannot create directory for {}: {}", name, e)),
            })?;

        // Catches symlinks created by earlier entries or the host
        let real_parent = tokio::fs::canonicalize(parent).await.map_err(|e| {
            EngineError::Resource(format!("cannot resolve directory for {}: {}", name, e))
        })?;
        if !real_parent.starts_with(root) {
            return Err(EngineError::input(format!(
                "path escapes workspace: {}",
                name
            )));
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                EngineError::input(format!("duplicate file entry: {}", name))
            }
            _ => EngineError::Resource(format!("cannot create {}: {}", name, e)),
        })?;
    file.write_all(content)
        .await
        .map_err(|e| EngineError::Resource(format!("cannot write {}: {}", name, e)))?;
    file.flush()
        .await
        .map_err(|e| EngineError::Resource(format!("cannot write {}: {}", name, e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        (root, manager)
    }

    #[test]
    fn test_acquire_creates_unique_empty_dirs() {
        let (_root, manager) = manager();
        let a = manager.acquire().unwrap();
        let b = manager.acquire().unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.name().starts_with(WORKSPACE_PREFIX));
        assert_eq!(std::fs::read_dir(a.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (_root, manager) = manager();
        let mut ws = manager.acquire().unwrap();
        let path = ws.path().to_path_buf();

        ws.release();
        assert!(!path.exists());
        assert!(ws.is_released());

        ws.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let (_root, manager) = manager();
        let ws = manager.acquire().unwrap();
        let path = ws.path().to_path_buf();
        std::fs::write(path.join("junk.aux"), b"x").unwrap();

        drop(ws);
        assert!(!path.exists());
    }

    #[test]
    fn test_acquire_fails_on_missing_root() {
        let manager = WorkspaceManager::new("/definitely/not/a/dir");
        assert!(matches!(manager.acquire(), Err(EngineError::Resource(_))));
    }

    #[tokio::test]
    async fn test_populate_preserves_relative_paths() {
        let (_root, manager) = manager();
        let ws = manager.acquire().unwrap();

        let mut files = BTreeMap::new();
        files.insert("chapters/intro.tex".to_string(), b"Intro".to_vec());
        files.insert("./figures/logo.png".to_string(), vec![0x89, 0x50, 0x4E, 0x47]);

        manager
            .populate(&ws, "main.tex", b"\\input{chapters/intro}", &files)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(ws.path().join("main.tex")).unwrap(),
            b"\\input{chapters/intro}"
        );
        assert_eq!(
            std::fs::read(ws.path().join("chapters/intro.tex")).unwrap(),
            b"Intro"
        );
        assert!(ws.path().join("figures/logo.png").exists());
    }

    #[tokio::test]
    async fn test_populate_rejects_traversal() {
        let (root, manager) = manager();
        let ws = manager.acquire().unwrap();

        let mut files = BTreeMap::new();
        files.insert("../escaped.tex".to_string(), b"x".to_vec());

        let err = manager
            .populate(&ws, "main.tex", b"doc", &files)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
        assert!(!root.path().join("escaped.tex").exists());
    }

    #[tokio::test]
    async fn test_populate_rejects_shadowing_main() {
        let (_root, manager) = manager();
        let ws = manager.acquire().unwrap();

        let mut files = BTreeMap::new();
        files.insert("./main.tex".to_string(), b"evil".to_vec());

        let err = manager
            .populate(&ws, "main.tex", b"doc", &files)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_populate_rejects_symlinked_directory() {
        let (_root, manager) = manager();
        let outside = tempfile::tempdir().unwrap();
        let ws = manager.acquire().unwrap();
        std::os::unix::fs::symlink(outside.path(), ws.path().join("link")).unwrap();

        let mut files = BTreeMap::new();
        files.insert("link/payload.tex".to_string(), b"x".to_vec());

        let err = manager
            .populate(&ws, "main.tex", b"doc", &files)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
        assert!(!outside.path().join("payload.tex").exists());
    }

    #[tokio::test]
    async fn test_populate_file_used_as_directory_is_input_error() {
        let (_root, manager) = manager();
        let ws = manager.acquire().unwrap();

        let mut files = BTreeMap::new();
        files.insert("fig".to_string(), b"a".to_vec());
        files.insert("fig/a.png".to_string(), b"b".to_vec());

        let err = manager
            .populate(&ws, "main.tex", b"doc", &files)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)), "{:?}", err);
    }

    #[test]
    fn test_sanitize_rejects_bad_names() {
        for name in ["", "/etc/passwd", "a/../../b", "..", "./.", "a\0b"] {
            assert!(
                sanitize_relative_path(name).is_err(),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_sanitize_drops_current_dir() {
        assert_eq!(
            sanitize_relative_path("./a/./b.tex").unwrap(),
            PathBuf::from("a/b.tex")
        );
    }

    proptest! {
        #[test]
        fn plain_relative_paths_stay_inside(
            parts in proptest::collection::vec("[a-zA-Z0-9_-]{1,8}", 1..5)
        ) {
            let root = Path::new("/srv/ws");
            let name = parts.join("/");
            let resolved = resolve_entry(root, &name).unwrap();
            prop_assert!(resolved.starts_with(root));
        }

        #[test]
        fn any_parent_component_is_rejected(
            before in proptest::collection::vec("[a-z]{1,6}", 0..3),
            after in proptest::collection::vec("[a-z]{1,6}", 0..3),
        ) {
            let mut parts = before.clone();
            parts.push("..".to_string());
            parts.extend(after);
            let name = parts.join("/");
            prop_assert!(resolve_entry(Path::new("/srv/ws"), &name).is_err());
        }
    }
}
