//! Execution engine for autonomous coding agents.
//!
//! The engine repeatedly picks a ready task from a task store, hands it to an
//! agent harness and records the outcome, within budget and time limits. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, budgets, escalation,
//!   events). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (task store, agent processes, hooks,
//!   ledger, status files, git worktrees). Each seam is a trait so tests can
//!   substitute in-memory fakes.
//!
//! Orchestration modules ([`run_loop`], [`parallel`]) coordinate core logic
//! with I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod parallel;
pub mod run_loop;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
