//! I/O adapters: processes, git, files and the collaborator seams.

pub mod backend;
pub mod breaker;
pub mod config;
pub mod git;
pub mod handoff;
pub mod harness;
pub mod hooks;
pub mod ledger;
pub mod process;
pub mod prompt;
pub mod status;
pub mod worktree;
