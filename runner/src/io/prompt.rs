//! Prompt builder for deterministic agent input.
//!
//! Templates mark sections with `<!-- section:KEY required|droppable -->`.
//! When the rendered task prompt exceeds its byte budget, droppable sections
//! go first in a fixed order, then the last remaining section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::Task;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 4] = ["epic", "labels", "dependencies", "failure"];

static SECTION_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->"));

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system template")?;
        env.add_template("task", TASK_TEMPLATE)
            .context("load task template")?;
        Ok(Self { env })
    }

    fn render_system(&self, input: &PromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            run_id => input.run_id,
            attempt => input.attempt,
            model => input.model,
        })?;
        Ok(rendered)
    }

    fn render_task(&self, input: &PromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("task")?;
        let rendered = template.render(context! {
            task => input.task,
            attempt => input.attempt,
            failure => input.previous_error.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Section content after the marker.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let re = match SECTION_RE.as_ref() {
        Ok(re) => re,
        Err(err) => {
            debug!(err = %err, "section marker regex unavailable, keeping prompt whole");
            return vec![ParsedSection {
                key: "all".to_string(),
                required: true,
                content: rendered.trim().to_string(),
            }];
        }
    };

    let markers: Vec<_> = re.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());

        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Drop droppable sections in [`DROP_ORDER`], then truncate the last section.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    let Some(last) = sections.last_mut() else {
        return;
    };
    let before_len = last.content.len();
    if before_len > allowed {
        const MARKER: &str = "\n[truncated]";
        let keep = if allowed > MARKER.len() {
            allowed - MARKER.len()
        } else {
            allowed
        };
        last.content.truncate(floor_char_boundary(&last.content, keep));
        if allowed > MARKER.len() {
            last.content.push_str(MARKER);
        }
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// All inputs needed to build prompts for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub run_id: &'a str,
    pub task: &'a Task,
    /// 1-based attempt number.
    pub attempt: u32,
    pub model: Option<&'a str>,
    /// Error from the previous failed attempt of this task.
    pub previous_error: Option<&'a str>,
}

/// Builds prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Render the system and task prompts. Only the task prompt is budgeted.
    pub fn build(&self, input: &PromptInputs<'_>) -> Result<PromptPack> {
        let engine = PromptEngine::new()?;
        let system = render_sections(&parse_sections(&engine.render_system(input)?));

        let mut sections = parse_sections(&engine.render_task(input)?);
        apply_budget_to_sections(&mut sections, self.budget_bytes);

        Ok(PromptPack {
            system,
            task: render_sections(&sections),
        })
    }
}

/// Rendered prompts ready to send to a harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    pub system: String,
    pub task: String,
}

impl PromptPack {
    /// Both prompts as one document, for the attempt's prompt artifact.
    pub fn render(&self) -> String {
        format!("{}\n\n---\n\n{}\n", self.system, self.task)
    }
}
