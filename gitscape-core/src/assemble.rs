//! Digest assembly: tree rendering and budgeted content selection.
//!
//! The rendered tree is charged against the budget first. Included files are
//! then taken in priority order (root documentation first, then by path) and
//! appended while their rendered block fits. The first block that does not
//! fit is skipped, selection stops there and the digest is marked truncated;
//! a file is never emitted partially.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::contract::{Budget, RepositoryMetadata};
use crate::error::DigestError;
use crate::progress::{ProgressNotifier, Stage};
use crate::walk::{estimate_tokens, FileEntry};

/// Root-level files that lead the content section, matched case-insensitively.
const PRIORITY_FILES: &[&str] = &[
    "readme.md",
    "contributing.md",
    "code_of_conduct.md",
    "security.md",
    "license",
    "license.md",
    "license.txt",
];

/// One file's contribution to the digest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContentBlock {
    pub path: String,
    pub content: String,
}

impl ContentBlock {
    /// The block exactly as it appears in the content section.
    pub fn render(&self) -> String {
        let newline = if self.content.ends_with('\n') { "" } else { "\n" };
        format!("## {}\n\n{}{}\n", self.path, self.content, newline)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DigestSummary {
    pub repository: String,
    pub url: String,
    pub reference: Option<String>,
    pub commit: Option<String>,
    /// Files with a content block.
    pub file_count: usize,
    /// Rendered bytes of the content section.
    pub total_size: u64,
    /// Advisory estimate for tree plus content.
    pub estimated_tokens: u64,
    pub truncated: bool,
    /// Eligible files left out for lack of budget.
    pub skipped_for_budget: usize,
    pub budget: Budget,
    pub generated_at: DateTime<Utc>,
}

/// The assembled, budget-bounded description of a repository snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Digest {
    pub summary: DigestSummary,
    pub tree: String,
    pub files: Vec<ContentBlock>,
}

impl Digest {
    /// Concatenated content blocks.
    pub fn content(&self) -> String {
        self.files.iter().map(ContentBlock::render).collect()
    }

    /// Markdown rendering: title, summary, tree, then one section per file.
    pub fn to_markdown(&self) -> String {
        let s = &self.summary;
        let mut out = String::new();
        let _ = writeln!(out, "# Repository Digest for {}\n", s.url);
        let _ = writeln!(out, "- Repository: {}", s.repository);
        if let Some(reference) = &s.reference {
            let _ = writeln!(out, "- Ref: {reference}");
        }
        if let Some(commit) = &s.commit {
            let _ = writeln!(out, "- Commit: {commit}");
        }
        let _ = writeln!(out, "- Files analyzed: {}", s.file_count);
        let _ = writeln!(out, "- Total size: {} bytes", s.total_size);
        let _ = writeln!(out, "- Estimated tokens: {}", s.estimated_tokens);
        if s.truncated {
            let _ = writeln!(
                out,
                "- Truncated: yes ({} files omitted to fit the budget)",
                s.skipped_for_budget
            );
        }
        let _ = writeln!(out, "\n## Directory Structure\n\n```text\n{}```\n", self.tree);
        out.push_str(&self.content());
        out
    }
}

fn cost(budget: Budget, text: &str) -> u64 {
    match budget {
        Budget::Bytes(_) => text.len() as u64,
        Budget::Tokens(_) => estimate_tokens(text),
    }
}

fn priority(path: &str) -> usize {
    if path.contains('/') {
        return PRIORITY_FILES.len();
    }
    let lower = path.to_ascii_lowercase();
    PRIORITY_FILES
        .iter()
        .position(|p| *p == lower)
        .unwrap_or(PRIORITY_FILES.len())
}

/// Build the digest from classified entries.
pub fn assemble(
    entries: &[FileEntry],
    root: &Path,
    metadata: &RepositoryMetadata,
    budget: Budget,
    config: &PipelineConfig,
    notifier: &ProgressNotifier,
    cancel: &CancellationToken,
) -> Result<Digest, DigestError> {
    notifier.emit(Stage::Assembling, "Rendering directory tree...");
    let tree = render_tree(&metadata.name, entries, config.tree_show_excluded);
    let tree_cost = cost(budget, &tree);
    let mut remaining = budget.limit().saturating_sub(tree_cost);
    debug!(tree_cost, remaining, ?budget, "Rendered tree");

    let mut candidates: Vec<&FileEntry> = entries.iter().filter(|e| e.is_included()).collect();
    candidates.sort_by(|a, b| {
        priority(&a.path)
            .cmp(&priority(&b.path))
            .then_with(|| a.path.cmp(&b.path))
    });

    let total = candidates.len();
    let batch = config.walk_event_batch.max(1);
    let mut files = Vec::new();
    let mut total_size = 0u64;
    let mut estimated_tokens = estimate_tokens(&tree);
    let mut skipped_for_budget = 0usize;

    for (index, entry) in candidates.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(DigestError::Cancelled);
        }
        if skipped_for_budget > 0 {
            skipped_for_budget += 1;
            continue;
        }

        let bytes = fs::read(root.join(&entry.path)).map_err(|e| {
            error!(error = ?e, path = %entry.path, "Failed to read file during assembly");
            DigestError::InternalError(format!("cannot read {}: {e}", entry.path))
        })?;
        let block = ContentBlock {
            path: entry.path.clone(),
            content: String::from_utf8_lossy(&bytes).into_owned(),
        };
        let rendered = block.render();
        let block_cost = cost(budget, &rendered);
        if block_cost > remaining {
            info!(
                path = %entry.path,
                block_cost,
                remaining,
                "Budget exhausted, skipping remaining files"
            );
            skipped_for_budget += 1;
            continue;
        }

        remaining -= block_cost;
        total_size += rendered.len() as u64;
        estimated_tokens += estimate_tokens(&rendered);
        files.push(block);

        let done = index + 1;
        if done % batch == 0 {
            notifier.emit_with_percentage(
                Stage::Assembling,
                format!("Currently processing {}...", entry.path),
                (done * 100 / total) as u8,
            );
        }
    }

    let truncated = skipped_for_budget > 0;
    info!(
        files = files.len(),
        total_size,
        estimated_tokens,
        truncated,
        skipped_for_budget,
        "Assembled digest"
    );
    notifier.emit_with_percentage(
        Stage::Done,
        format!("Digest ready: {} files.", files.len()),
        100,
    );

    Ok(Digest {
        summary: DigestSummary {
            repository: metadata.name.clone(),
            url: metadata.url.clone(),
            reference: metadata.reference.clone(),
            commit: metadata.commit.clone(),
            file_count: files.len(),
            total_size,
            estimated_tokens,
            truncated,
            skipped_for_budget,
            budget,
            generated_at: Utc::now(),
        },
        tree,
        files,
    })
}

#[derive(Default)]
struct TreeNode {
    dirs: BTreeMap<String, TreeNode>,
    files: BTreeMap<String, Option<String>>,
}

impl TreeNode {
    fn insert(&mut self, path: &str, annotation: Option<String>) {
        match path.split_once('/') {
            Some((dir, rest)) => self
                .dirs
                .entry(dir.to_string())
                .or_default()
                .insert(rest, annotation),
            None => {
                self.files.insert(path.to_string(), annotation);
            }
        }
    }

    fn render(&self, prefix: &str, out: &mut String) {
        let count = self.dirs.len() + self.files.len();
        let mut position = 0;
        for (name, child) in &self.dirs {
            position += 1;
            let last = position == count;
            let _ = writeln!(out, "{prefix}{}{name}/", if last { "└── " } else { "├── " });
            let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
            child.render(&child_prefix, out);
        }
        for (name, annotation) in &self.files {
            position += 1;
            let branch = if position == count { "└── " } else { "├── " };
            match annotation {
                Some(note) => {
                    let _ = writeln!(out, "{prefix}{branch}{name} [excluded: {note}]");
                }
                None => {
                    let _ = writeln!(out, "{prefix}{branch}{name}");
                }
            }
        }
    }
}

/// Prefix-style tree of the included paths, plus annotated excluded paths
/// when `show_excluded` is set.
pub fn render_tree(root_name: &str, entries: &[FileEntry], show_excluded: bool) -> String {
    let mut root = TreeNode::default();
    for entry in entries {
        match entry.exclusion() {
            None => root.insert(&entry.path, None),
            Some(reason) if show_excluded => root.insert(&entry.path, Some(reason.to_string())),
            Some(_) => {}
        }
    }
    let mut out = format!("{root_name}/\n");
    root.render("", &mut out);
    out
}
