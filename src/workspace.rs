//! Per-application workspace
//!
//! Every MicroApplication owns the directory `<root>/<namespace>/<name>`. It is
//! created on the first reconciliation, pulled on every later one and never
//! removed by the operator.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::manifest::{split_manifests, ResourceDescriptor, MANIFEST_EXTENSIONS};
use crate::source::{CancelFlag, SourceControl, SourceRef};
use crate::Error;

/// Checkout directory for one application
///
/// Sync and discovery hold the workspace lock for as long as their blocking
/// task runs, including after the awaiting future has been dropped. Two
/// workspaces for the same directory only exclude each other when they come
/// from the same [`WorkspaceLocks`].
#[derive(Clone, Debug)]
pub struct Workspace {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Workspace {
    /// Workspace for `namespace/name` under `root`, with a lock of its own
    pub fn new(root: impl AsRef<Path>, namespace: &str, name: &str) -> Self {
        Self::at(root.as_ref().join(namespace).join(name))
    }

    /// Workspace at an explicit directory, with a lock of its own
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::default(),
        }
    }

    /// Workspace directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the workspace directory if it does not exist
    pub fn ensure(&self) -> Result<(), Error> {
        std::fs::create_dir_all(&self.path).map_err(|e| {
            Error::internal_with_context(
                "workspace",
                format!("failed to create {}: {}", self.path.display(), e),
            )
        })
    }

    /// Bring the workspace to the latest revision of `source`
    ///
    /// Pulls when the workspace already holds history, clones otherwise.
    /// Returns the checked-out commit id. Setting `cancel` makes the git
    /// operation stop at its next check.
    pub async fn sync(
        &self,
        source_control: Arc<dyn SourceControl>,
        source: &SourceRef,
        cancel: &CancelFlag,
    ) -> Result<String, Error> {
        self.ensure()?;

        let guard = self.lock.clone().lock_owned().await;
        let path = self.path.clone();
        let source = source.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            if source_control.has_history(&path) {
                debug!(path = %path.display(), "Workspace has history, pulling");
                source_control.pull(&source, &path, &cancel)
            } else {
                info!(path = %path.display(), url = %source.url, "Workspace is new, cloning");
                source_control.clone_repo(&source, &path, &cancel)
            }
        })
        .await
        .map_err(|e| Error::internal_with_context("workspace", e.to_string()))?
    }

    /// Split every manifest under `paths` (relative to the workspace)
    pub async fn discover(&self, paths: Vec<String>) -> Result<Vec<ResourceDescriptor>, Error> {
        let guard = self.lock.clone().lock_owned().await;
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            discover_manifests(&root, &paths)
        })
        .await
        .map_err(|e| Error::internal_with_context("workspace", e.to_string()))?
    }

    /// Wait until no blocking sync or discovery is running in the workspace
    pub async fn wait_idle(&self) {
        let _guard = self.lock.lock().await;
    }
}

/// Shared lock table, one lock per workspace directory
///
/// Every reconciliation of the same application gets a [`Workspace`] with
/// the same lock, so a git operation left behind by a timed-out attempt
/// finishes before the next attempt touches the directory.
#[derive(Clone, Debug, Default)]
pub struct WorkspaceLocks {
    locks: Arc<StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl WorkspaceLocks {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Workspace for `namespace/name` under `root`
    pub fn workspace(&self, root: impl AsRef<Path>, namespace: &str, name: &str) -> Workspace {
        self.at(root.as_ref().join(namespace).join(name))
    }

    /// Workspace at an explicit directory
    pub fn at(&self, path: impl Into<PathBuf>) -> Workspace {
        let path = path.into();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let lock = locks.entry(path.clone()).or_default().clone();
        Workspace { path, lock }
    }
}

/// Walk `paths` under `root` and split every manifest file found
///
/// Directories are walked recursively in file-name order, skipping `.git`.
/// Files (including a path naming a file directly) are selected by extension,
/// case-insensitively. Symlinks are not followed.
pub fn discover_manifests<S: AsRef<str>>(
    root: &Path,
    paths: &[S],
) -> Result<Vec<ResourceDescriptor>, Error> {
    let mut resources = Vec::new();

    for rel in paths {
        let rel = rel.as_ref();
        let rel_path = Path::new(rel);
        if rel_path.is_absolute()
            || rel_path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::discovery_failed(
                rel,
                "path must stay inside the workspace",
            ));
        }

        let start = root.join(rel_path);
        let walker = WalkDir::new(&start)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");

        for entry in walker {
            let entry = entry.map_err(|e| {
                let at = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| start.display().to_string());
                Error::discovery_failed(at, e.to_string())
            })?;

            if !entry.file_type().is_file() || !is_manifest(entry.path()) {
                continue;
            }

            let file = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            let data = std::fs::read(entry.path())
                .map_err(|e| Error::discovery_failed(file.clone(), e.to_string()))?;
            let mut parsed = split_manifests(&data)
                .map_err(|e| Error::parse_failed(file.clone(), e.to_string()))?;

            debug!(file = %file, resources = parsed.len(), "Split manifest file");
            resources.append(&mut parsed);
        }
    }

    Ok(resources)
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            MANIFEST_EXTENSIONS
                .iter()
                .any(|m| ext.eq_ignore_ascii_case(m))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSourceControl;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn workspace_path_is_keyed_by_namespace_and_name() {
        let ws = Workspace::new("/tmp", "team-a", "guestbook");
        assert_eq!(ws.path(), Path::new("/tmp/team-a/guestbook"));
    }

    #[test]
    fn ensure_creates_the_directory() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new(root.path(), "team-a", "guestbook");
        ws.ensure().unwrap();
        assert!(ws.path().is_dir());
        // idempotent
        ws.ensure().unwrap();
    }

    // =========================================================================
    // Sync Stories
    // =========================================================================

    /// Story: A workspace that already has a checkout is pulled, not cloned
    #[tokio::test]
    async fn story_existing_checkout_is_pulled() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new(root.path(), "team-a", "guestbook");

        let mut source = MockSourceControl::new();
        source.expect_has_history().returning(|_| true);
        source.expect_clone_repo().never();
        source
            .expect_pull()
            .times(1)
            .returning(|_, _, _| Ok("feedface".to_string()));

        let rev = ws
            .sync(Arc::new(source), &SourceRef::new("https://x/y"), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(rev, "feedface");
    }

    /// Story: The first sync of an application clones into a fresh directory
    #[tokio::test]
    async fn story_new_workspace_is_cloned() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new(root.path(), "team-a", "guestbook");
        let expected_path = ws.path().to_path_buf();

        let mut source = MockSourceControl::new();
        source.expect_has_history().returning(|_| false);
        source.expect_pull().never();
        source
            .expect_clone_repo()
            .withf(move |src, path, _| src.url == "https://x/y" && path == expected_path)
            .times(1)
            .returning(|_, _, _| Ok("c0ffee".to_string()));

        let rev = ws
            .sync(Arc::new(source), &SourceRef::new("https://x/y"), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(rev, "c0ffee");
        assert!(ws.path().is_dir());
    }

    #[tokio::test]
    async fn sync_errors_propagate() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new(root.path(), "team-a", "guestbook");

        let mut source = MockSourceControl::new();
        source.expect_has_history().returning(|_| true);
        source
            .expect_pull()
            .returning(|_, _, _| Err(Error::sync_failed("https://x/y", "ws", "auth failed")));

        let err = ws
            .sync(Arc::new(source), &SourceRef::new("https://x/y"), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SyncFailed { .. }));
    }

    /// Story: A sync started through one lock table waits for the previous one
    #[tokio::test]
    async fn story_syncs_on_one_workspace_never_overlap() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut source = MockSourceControl::new();
        source.expect_has_history().returning(|_| true);
        let (a, p) = (active.clone(), peak.clone());
        source.expect_pull().returning(move |_, _, _| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            a.fetch_sub(1, Ordering::SeqCst);
            Ok("abc".to_string())
        });
        let source: Arc<dyn SourceControl> = Arc::new(source);

        let root = tempfile::tempdir().unwrap();
        let locks = WorkspaceLocks::new();
        let first = locks.workspace(root.path(), "team-a", "guestbook");
        let second = locks.workspace(root.path(), "team-a", "guestbook");
        let src = SourceRef::new("https://x/y");
        let cancel = CancelFlag::new();

        let (r1, r2) = tokio::join!(
            first.sync(source.clone(), &src, &cancel),
            second.sync(source.clone(), &src, &cancel)
        );
        assert!(r1.is_ok() && r2.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    /// Story: A dropped sync keeps the workspace busy until git returns
    #[tokio::test]
    async fn story_dropped_sync_still_holds_the_workspace() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        let mut source = MockSourceControl::new();
        source.expect_has_history().returning(|_| false);
        source.expect_clone_repo().returning(move |_, _, _| {
            std::thread::sleep(std::time::Duration::from_millis(100));
            f.store(true, Ordering::SeqCst);
            Ok("abc".to_string())
        });

        let root = tempfile::tempdir().unwrap();
        let ws = WorkspaceLocks::new().workspace(root.path(), "team-a", "guestbook");
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            ws.sync(Arc::new(source), &SourceRef::new("https://x/y"), &CancelFlag::new()),
        )
        .await;
        assert!(abandoned.is_err());

        ws.wait_idle().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn lock_table_hands_out_workspaces_by_directory() {
        let locks = WorkspaceLocks::new();
        let a = locks.workspace("/tmp", "team-a", "guestbook");
        let b = locks.workspace("/tmp", "team-a", "guestbook");
        let c = locks.workspace("/tmp", "team-b", "guestbook");
        assert!(Arc::ptr_eq(&a.lock, &b.lock));
        assert!(!Arc::ptr_eq(&a.lock, &c.lock));
        assert_eq!(locks.at("/tmp/team-a/guestbook").path(), a.path());
    }

    // =========================================================================
    // Discovery Stories
    // =========================================================================

    /// Story: Discovery walks directories in name order and keeps in-file order
    #[test]
    fn story_discovery_follows_walk_then_document_order() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "app/b.yaml", "kind: B1\n---\nkind: B2\n");
        write(root.path(), "app/a.yml", "kind: A\n");
        write(root.path(), "app/sub/c.JSON", r#"{"kind":"C"}"#);
        write(root.path(), "app/README.md", "kind: NotAManifest\n");

        let out = discover_manifests(root.path(), &["app"]).unwrap();
        let kinds: Vec<_> = out.iter().map(|d| d.kind.as_str()).collect();
        assert_eq!(kinds, vec!["A", "B1", "B2", "C"]);
    }

    #[test]
    fn git_directory_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), ".git/config.yaml", "kind: Hidden\n");
        write(root.path(), "deploy.yaml", "kind: Visible\n");

        let out = discover_manifests(root.path(), &["."]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "Visible");
    }

    #[test]
    fn file_paths_are_filtered_by_extension_too() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "deploy.yaml", "kind: A\n");
        write(root.path(), "notes.txt", "kind: B\n");

        assert_eq!(discover_manifests(root.path(), &["deploy.yaml"]).unwrap().len(), 1);
        assert!(discover_manifests(root.path(), &["notes.txt"]).unwrap().is_empty());
    }

    #[test]
    fn multiple_paths_are_concatenated_in_order() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "z/one.yaml", "kind: Z\n");
        write(root.path(), "a/two.yaml", "kind: A\n");

        let out = discover_manifests(root.path(), &["z", "a"]).unwrap();
        let kinds: Vec<_> = out.iter().map(|d| d.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Z", "A"]);
    }

    #[test]
    fn missing_path_is_a_discovery_error() {
        let root = tempfile::tempdir().unwrap();
        let err = discover_manifests(root.path(), &["nope"]).unwrap_err();
        assert!(matches!(err, Error::DiscoveryFailed { .. }));
    }

    #[test]
    fn escaping_path_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_manifests(root.path(), &["../elsewhere"]).unwrap_err(),
            Error::DiscoveryFailed { .. }
        ));
    }

    #[test]
    fn malformed_manifest_names_the_file() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "app/bad.yaml", "kind: [oops\n");

        let err = discover_manifests(root.path(), &["app"]).unwrap_err();
        match err {
            Error::ParseFailed { path, .. } => assert_eq!(path, "app/bad.yaml"),
            other => panic!("expected ParseFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn workspace_discover_reads_relative_to_checkout() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new(root.path(), "team-a", "guestbook");
        write(ws.path(), "guestbook/svc.yaml", "apiVersion: v1\nkind: Service\n");

        let out = ws.discover(vec!["guestbook".to_string()]).await.unwrap();
        assert_eq!(out[0].kind, "Service");
    }
}
