//! Git adapter for the worktree manager.
//!
//! We keep a small, explicit wrapper around `git` subprocess calls rather than
//! linking a git library; every call runs in a fixed working directory.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeRecord {
    pub path: PathBuf,
    /// HEAD commit; empty for a bare entry.
    pub head: String,
    /// Short branch name (`refs/heads/` stripped); `None` when detached or bare.
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
    pub locked: bool,
    pub prunable: bool,
}

/// How `worktree add` should resolve the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode<'a> {
    /// `-b <branch>`: create a new branch at HEAD.
    NewBranch(&'a str),
    /// Check out an existing branch.
    Existing(&'a str),
    /// `--detach` at HEAD.
    Detached,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD in the working directory.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Absolute path of the repository's top level.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Local branches fully merged into `base`.
    pub fn merged_branches(&self, base: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&[
            "branch",
            "--format=%(refname:short)",
            "--merged",
            base,
        ])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `git worktree add` at `path`.
    #[instrument(skip_all, fields(path = %path.display(), mode = ?mode))]
    pub fn worktree_add(&self, path: &Path, mode: AddMode<'_>) -> Result<()> {
        let path_arg = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "add"];
        match mode {
            AddMode::NewBranch(branch) => {
                args.extend(["-b", branch, path_arg.as_str()]);
            }
            AddMode::Existing(branch) => {
                args.extend([path_arg.as_str(), branch]);
            }
            AddMode::Detached => {
                args.extend(["--detach", path_arg.as_str()]);
            }
        }
        debug!("adding worktree");
        self.run_checked(&args)?;
        Ok(())
    }

    /// Parsed `git worktree list --porcelain`.
    pub fn worktree_list(&self) -> Result<Vec<WorktreeRecord>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_porcelain(&out))
    }

    /// `git worktree remove`; `force` overrides both dirty and locked checks.
    #[instrument(skip_all, fields(path = %path.display(), force))]
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path_arg = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.extend(["--force", "--force"]);
        }
        args.push(path_arg.as_str());
        debug!("removing worktree");
        self.run_checked(&args)?;
        Ok(())
    }

    /// Drop administrative data for worktrees whose directories are gone.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Parse porcelain output: blank-line separated stanzas of `key value` lines.
pub fn parse_worktree_porcelain(out: &str) -> Vec<WorktreeRecord> {
    let mut records = Vec::new();
    let mut current: Option<WorktreeRecord> = None;

    for line in out.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if let Some(record) = current.take() {
                records.push(record);
            }
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        if key == "worktree" {
            if let Some(record) = current.take() {
                records.push(record);
            }
            current = Some(WorktreeRecord {
                path: PathBuf::from(value),
                ..WorktreeRecord::default()
            });
            continue;
        }
        let Some(record) = current.as_mut() else {
            continue;
        };
        match key {
            "HEAD" => record.head = value.to_string(),
            "branch" => {
                let short = value.strip_prefix("refs/heads/").unwrap_or(value);
                record.branch = Some(short.to_string());
            }
            "bare" => record.bare = true,
            "detached" => record.detached = true,
            "locked" => record.locked = true,
            "prunable" => record.prunable = true,
            _ => {}
        }
    }
    if let Some(record) = current {
        records.push(record);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /repo/.worktrees/t-1
HEAD 2222222222222222222222222222222222222222
branch refs/heads/runner/t-1
locked reason: in use

worktree /repo/.worktrees/t-2
HEAD 3333333333333333333333333333333333333333
detached
prunable gitdir file points to non-existent location
";

    #[test]
    fn parses_porcelain_stanzas() {
        let records = parse_worktree_porcelain(SAMPLE);
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].path, PathBuf::from("/repo"));
        assert_eq!(records[0].branch.as_deref(), Some("main"));
        assert!(!records[0].locked);

        assert_eq!(records[1].branch.as_deref(), Some("runner/t-1"));
        assert!(records[1].locked);

        assert!(records[2].detached);
        assert!(records[2].prunable);
        assert_eq!(records[2].branch, None);
    }

    #[test]
    fn parses_bare_entry() {
        let records = parse_worktree_porcelain("worktree /srv/repo.git\nbare\n");
        assert_eq!(records.len(), 1);
        assert!(records[0].bare);
        assert!(records[0].head.is_empty());
    }

    #[test]
    fn empty_output_yields_nothing() {
        assert!(parse_worktree_porcelain("").is_empty());
    }
}
