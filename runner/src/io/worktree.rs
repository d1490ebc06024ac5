//! Isolated per-task working copies backed by `git worktree`.
//!
//! Each task gets one subdirectory `<base_dir>/<stem>` on its own branch
//! (`<branch_prefix><stem>`), where the stem is [`sanitize_task_id`]. Creation and removal for the same path are
//! serialized through a per-path lock; distinct paths proceed concurrently.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::git::{AddMode, Git, WorktreeRecord};

pub const DEFAULT_BASE_DIR: &str = ".worktrees";
pub const DEFAULT_BRANCH_PREFIX: &str = "runner/";

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("worktree path already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("worktree not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("path is not a registered worktree: {}", .0.display())]
    NotAWorktree(PathBuf),
    #[error("worktree is locked (use force to remove): {}", .0.display())]
    Locked(PathBuf),
    #[error("refusing to remove the main or bare worktree: {}", .0.display())]
    BareRoot(PathBuf),
    #[error(transparent)]
    Git(#[from] anyhow::Error),
}

/// A registered worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub commit: String,
    pub bare: bool,
    pub detached: bool,
    pub locked: bool,
}

impl From<WorktreeRecord> for WorktreeInfo {
    fn from(record: WorktreeRecord) -> Self {
        Self {
            path: record.path,
            branch: record.branch,
            commit: record.head,
            bare: record.bare,
            detached: record.detached,
            locked: record.locked,
        }
    }
}

#[derive(Debug)]
pub struct WorktreeManager {
    git: Git,
    repo_root: PathBuf,
    base_dir: PathBuf,
    branch_prefix: String,
    path_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl WorktreeManager {
    /// Manager for the repository containing `repo`.
    ///
    /// A relative `base_dir` is resolved against the repository top level.
    pub fn new(
        repo: &Path,
        base_dir: impl AsRef<Path>,
        branch_prefix: impl Into<String>,
    ) -> Result<Self, WorktreeError> {
        let repo_root = Git::new(repo)
            .toplevel()
            .with_context(|| format!("resolve repository root for {}", repo.display()))?;
        let base_dir = base_dir.as_ref();
        let base_dir = if base_dir.is_absolute() {
            base_dir.to_path_buf()
        } else {
            repo_root.join(base_dir)
        };
        debug!(root = %repo_root.display(), base = %base_dir.display(), "worktree manager ready");
        Ok(Self {
            git: Git::new(&repo_root),
            repo_root,
            base_dir,
            branch_prefix: branch_prefix.into(),
            path_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(sanitize_task_id(task_id))
    }

    pub fn branch_for(&self, task_id: &str) -> String {
        format!("{}{}", self.branch_prefix, sanitize_task_id(task_id))
    }

    /// Create the worktree for `task_id`.
    ///
    /// With a branch, `create_branch` selects between `-b <branch>` and checking
    /// out an existing branch; without one the worktree is detached at HEAD.
    #[instrument(skip(self), fields(path))]
    pub fn create(
        &self,
        task_id: &str,
        branch: Option<&str>,
        create_branch: bool,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let path = self.path_for(task_id);
        tracing::Span::current().record("path", tracing::field::display(path.display()));
        let lock = self.path_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if path.exists() || self.find(&path)?.is_some() {
            return Err(WorktreeError::AlreadyExists(path));
        }
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("create worktree base {}", self.base_dir.display()))?;

        let mode = match branch {
            Some(branch) if create_branch => AddMode::NewBranch(branch),
            Some(branch) => AddMode::Existing(branch),
            None => AddMode::Detached,
        };
        self.git.worktree_add(&path, mode)?;

        let commit = Git::new(&path).head_sha()?;
        info!(task_id, branch = ?branch, "created worktree");
        Ok(WorktreeInfo {
            path,
            branch: branch.map(str::to_string),
            commit,
            bare: false,
            detached: branch.is_none(),
            locked: false,
        })
    }

    /// All worktrees git knows about, main worktree first.
    pub fn list(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let records = self.git.worktree_list()?;
        Ok(records.into_iter().map(WorktreeInfo::from).collect())
    }

    /// Remove the worktree at `path`, then prune stale metadata.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn remove(&self, path: impl AsRef<Path>, force: bool) -> Result<(), WorktreeError> {
        let path = self.resolve(path.as_ref());
        let lock = self.path_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let records = self.git.worktree_list()?;
        let Some(position) = records.iter().position(|r| same_path(&r.path, &path)) else {
            return Err(if path.exists() {
                WorktreeError::NotAWorktree(path)
            } else {
                WorktreeError::NotFound(path)
            });
        };
        let record = &records[position];
        if record.bare || position == 0 || same_path(&record.path, &self.repo_root) {
            return Err(WorktreeError::BareRoot(path));
        }
        if record.locked && !force {
            return Err(WorktreeError::Locked(path));
        }

        if path.exists() {
            self.git.worktree_remove(&path, force)?;
        } else {
            debug!("worktree directory already gone, pruning metadata only");
        }
        if let Err(err) = self.git.worktree_prune() {
            warn!(err = %err, "worktree prune failed");
        }
        info!("removed worktree");
        Ok(())
    }

    /// Remove worktrees whose branch is merged into `base_branch`.
    ///
    /// The main worktree, the base branch itself, detached and locked entries
    /// are skipped. Per-entry failures are logged and skipped.
    #[instrument(skip(self))]
    pub fn cleanup_merged(&self, base_branch: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let merged = self.git.merged_branches(base_branch)?;
        let mut removed = Vec::new();

        for (idx, info) in self.list()?.into_iter().enumerate() {
            if idx == 0 || info.bare || info.locked {
                continue;
            }
            let Some(branch) = info.branch.as_deref() else {
                continue;
            };
            if branch == base_branch || !merged.iter().any(|m| m == branch) {
                continue;
            }
            match self.remove(&info.path, false) {
                Ok(()) => removed.push(info),
                Err(err) => warn!(path = %info.path.display(), err = %err, "cleanup skipped worktree"),
            }
        }
        info!(removed = removed.len(), "merged worktree cleanup finished");
        Ok(removed)
    }

    /// Existing worktree for `task_id`, creating it on [`Self::branch_for`] when asked.
    pub fn get_for_task(
        &self,
        task_id: &str,
        create_if_missing: bool,
    ) -> Result<Option<WorktreeInfo>, WorktreeError> {
        if !create_if_missing {
            let path = self.path_for(task_id);
            return Ok(self.find(&path)?.map(Into::into));
        }
        self.get_or_create_for_task(task_id).map(|(info, _)| Some(info))
    }

    /// Worktree for `task_id` and whether this call created it.
    pub fn get_or_create_for_task(
        &self,
        task_id: &str,
    ) -> Result<(WorktreeInfo, bool), WorktreeError> {
        let path = self.path_for(task_id);
        if let Some(record) = self.find(&path)? {
            return Ok((record.into(), false));
        }
        let branch = self.branch_for(task_id);
        let exists = self.git.branch_exists(&branch)?;
        let info = self.create(task_id, Some(&branch), !exists)?;
        Ok((info, true))
    }

    fn find(&self, path: &Path) -> Result<Option<WorktreeRecord>, WorktreeError> {
        let records = self.git.worktree_list()?;
        Ok(records.into_iter().find(|r| same_path(&r.path, path)))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root.join(path)
        };
        fs::canonicalize(&joined).unwrap_or(joined)
    }

    fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .path_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }
}

const DIGEST_SEPARATOR: &str = "--";
const DIGEST_BYTES: usize = 5;

/// Map a task id to a stem usable both as a path component and a branch name.
///
/// Ids made only of `[A-Za-z0-9._-]` that are already valid ref components
/// map to themselves. Any other id is rewritten and suffixed with
/// `--<digest of the raw id>`, so distinct ids never share a stem.
pub fn sanitize_task_id(task_id: &str) -> String {
    if is_plain_stem(task_id) {
        return task_id.to_string();
    }
    let mut base: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if base.is_empty() || base.starts_with('-') {
        base.insert(0, '_');
    }
    let digest = Sha256::digest(task_id.as_bytes());
    format!("{base}{DIGEST_SEPARATOR}{}", hex::encode(&digest[..DIGEST_BYTES]))
}

fn is_plain_stem(task_id: &str) -> bool {
    !task_id.is_empty()
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !task_id.starts_with(['.', '-'])
        && !task_id.ends_with('.')
        && !task_id.ends_with(".lock")
        && !task_id.contains("..")
        && !has_digest_suffix(task_id)
}

fn has_digest_suffix(stem: &str) -> bool {
    stem.rsplit_once(DIGEST_SEPARATOR).is_some_and(|(_, tail)| {
        tail.len() == DIGEST_BYTES * 2 && tail.chars().all(|c| c.is_ascii_hexdigit())
    })
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    fn manager(repo: &TestRepo) -> WorktreeManager {
        WorktreeManager::new(repo.path(), DEFAULT_BASE_DIR, DEFAULT_BRANCH_PREFIX)
            .expect("manager")
    }

    #[test]
    fn sanitizes_path_components() {
        assert_eq!(sanitize_task_id("bd-12.3"), "bd-12.3");
        assert_eq!(sanitize_task_id("epic_7"), "epic_7");
        assert!(sanitize_task_id("a/b c").starts_with("a_b_c--"));
        assert!(sanitize_task_id("..").starts_with("__--"));
        assert!(sanitize_task_id("").starts_with("_--"));
        assert!(sanitize_task_id("-x").starts_with("_-x--"));
        assert!(sanitize_task_id("v1.lock").starts_with("v1_lock--"));
        assert_eq!(sanitize_task_id("a/b c"), sanitize_task_id("a/b c"));
    }

    #[test]
    fn rewritten_ids_do_not_collide() {
        let ids = ["epic/7", "epic_7", "epic:7", "epic 7"];
        let stems: std::collections::HashSet<String> =
            ids.iter().map(|id| sanitize_task_id(id)).collect();
        assert_eq!(stems.len(), ids.len());

        // A plain id shaped like a rewritten stem is rewritten too.
        let lookalike = sanitize_task_id("epic/7");
        assert_ne!(sanitize_task_id(&lookalike), lookalike);
    }

    #[test]
    fn colliding_ids_get_distinct_worktrees_and_branches() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);

        let (slash, created_slash) = mgr.get_or_create_for_task("epic/7").expect("epic/7");
        let (underscore, created_underscore) =
            mgr.get_or_create_for_task("epic_7").expect("epic_7");
        assert!(created_slash && created_underscore);
        assert!(!same_path(&slash.path, &underscore.path));
        assert_ne!(slash.branch, underscore.branch);
        assert_eq!(underscore.branch.as_deref(), Some("runner/epic_7"));
    }

    #[test]
    fn ids_invalid_as_ref_names_still_get_a_branch() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);
        for id in ["feat:1", "fix..it", "a b", "x~1^2"] {
            let (info, created) = mgr
                .get_or_create_for_task(id)
                .unwrap_or_else(|err| panic!("{id}: {err}"));
            assert!(created);
            assert_eq!(info.branch, Some(mgr.branch_for(id)));
        }
    }

    #[test]
    fn reports_whether_the_worktree_was_created() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);
        let (_, first) = mgr.get_or_create_for_task("t-3").expect("create");
        let (_, second) = mgr.get_or_create_for_task("t-3").expect("reuse");
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn create_list_remove_round() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);

        let info = mgr
            .create("t-1", Some("runner/t-1"), true)
            .expect("create");
        assert!(info.path.is_dir());
        assert_eq!(info.branch.as_deref(), Some("runner/t-1"));
        assert_eq!(info.commit.len(), 40);

        let listed = mgr.list().expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].branch.as_deref(), Some("runner/t-1"));

        mgr.remove(&info.path, false).expect("remove");
        assert!(!info.path.exists());
        assert_eq!(mgr.list().expect("list").len(), 1);
    }

    #[test]
    fn second_create_at_same_path_fails() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);
        mgr.create("t-1", None, false).expect("create");
        let err = mgr
            .create("t-1", Some("runner/other"), true)
            .expect_err("occupied");
        assert!(matches!(err, WorktreeError::AlreadyExists(_)));
    }

    #[test]
    fn remove_classifies_bad_targets() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);

        let missing = mgr.remove(repo.path().join("nope"), false).expect_err("missing");
        assert!(matches!(missing, WorktreeError::NotFound(_)));

        let plain = repo.path().join("plain");
        fs::create_dir_all(&plain).expect("mkdir");
        let not_wt = mgr.remove(&plain, false).expect_err("plain dir");
        assert!(matches!(not_wt, WorktreeError::NotAWorktree(_)));

        let main = mgr.remove(repo.path(), true).expect_err("main");
        assert!(matches!(main, WorktreeError::BareRoot(_)));
    }

    #[test]
    fn locked_worktree_needs_force() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);
        let info = mgr.create("t-1", None, false).expect("create");
        repo.git(&["worktree", "lock", &info.path.to_string_lossy()])
            .expect("lock");

        let err = mgr.remove(&info.path, false).expect_err("locked");
        assert!(matches!(err, WorktreeError::Locked(_)));
        mgr.remove(&info.path, true).expect("forced remove");
        assert!(!info.path.exists());
    }

    #[test]
    fn get_for_task_is_idempotent() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);
        assert!(mgr.get_for_task("t-9", false).expect("lookup").is_none());

        let first = mgr
            .get_for_task("t-9", true)
            .expect("create")
            .expect("some");
        let second = mgr
            .get_for_task("t-9", true)
            .expect("reuse")
            .expect("some");
        assert!(same_path(&first.path, &second.path));
        assert_eq!(second.branch.as_deref(), Some("runner/t-9"));
    }

    #[test]
    fn cleanup_removes_merged_branches_only() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);
        let base = repo.current_branch().expect("branch");

        let merged = mgr
            .create("merged", Some("runner/merged"), true)
            .expect("create merged");
        let ahead = mgr
            .create("ahead", Some("runner/ahead"), true)
            .expect("create ahead");
        fs::write(ahead.path.join("new.txt"), "work\n").expect("write");
        TestRepo::commit_all_in(&ahead.path, "ahead work").expect("commit");

        let removed = mgr.cleanup_merged(&base).expect("cleanup");
        assert_eq!(removed.len(), 1);
        assert!(!merged.path.exists());
        assert!(ahead.path.exists());
    }

    #[test]
    fn concurrent_creates_on_distinct_paths() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);
        std::thread::scope(|scope| {
            for i in 0..4 {
                let mgr = &mgr;
                scope.spawn(move || {
                    let id = format!("c-{i}");
                    mgr.create(&id, None, false).expect("create");
                });
            }
        });
        assert_eq!(mgr.list().expect("list").len(), 5);
    }
}
