//! Tree walking and file classification.
//!
//! [`walk`] recursively enumerates a workspace and returns one [`FileEntry`]
//! per file, sorted by path. Every entry carries a verdict; excluded entries
//! say why. Filesystem errors on individual entries are recorded on the entry
//! as [`ExclusionReason::Unreadable`] and the walk carries on.
//!
//! Directory recursion keeps a set of canonical paths already entered, so a
//! symlink back to an ancestor is never followed twice, and it stops at the
//! configured depth ceiling. Links resolving outside the workspace are never
//! followed.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::contract::DigestRequest;
use crate::error::DigestError;
use crate::pattern::{PatternError, PatternSet};
use crate::progress::{ProgressNotifier, Stage};

/// Why a file contributes no content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Larger than the per-file ceiling.
    SizeCap,
    /// Failed the text check.
    Binary,
    /// Matched a user exclusion pattern.
    UserPattern,
    /// Matched the default ignore set.
    DefaultIgnore,
    /// Inclusion patterns were given and none matched.
    NotIncluded,
    /// Beyond the maximum number of files.
    FileLimit,
    /// A symbolic link that is dangling or leaves the workspace.
    Symlink,
    /// The entry could not be read.
    Unreadable(String),
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::SizeCap => write!(f, "too large"),
            ExclusionReason::Binary => write!(f, "binary"),
            ExclusionReason::UserPattern => write!(f, "excluded by pattern"),
            ExclusionReason::DefaultIgnore => write!(f, "ignored by default"),
            ExclusionReason::NotIncluded => write!(f, "not included"),
            ExclusionReason::FileLimit => write!(f, "file limit"),
            ExclusionReason::Symlink => write!(f, "symlink"),
            ExclusionReason::Unreadable(msg) => write!(f, "unreadable: {msg}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Included,
    Excluded(ExclusionReason),
}

/// A classified candidate file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Workspace-relative, `/`-separated.
    pub path: String,
    pub size: u64,
    pub binary: bool,
    pub token_estimate: u64,
    pub verdict: Verdict,
}

impl FileEntry {
    pub fn is_included(&self) -> bool {
        matches!(self.verdict, Verdict::Included)
    }

    pub fn exclusion(&self) -> Option<&ExclusionReason> {
        match &self.verdict {
            Verdict::Included => None,
            Verdict::Excluded(reason) => Some(reason),
        }
    }

    fn excluded(path: String, size: u64, binary: bool, reason: ExclusionReason) -> Self {
        Self {
            path,
            size,
            binary,
            token_estimate: 0,
            verdict: Verdict::Excluded(reason),
        }
    }
}

/// User patterns layered over the default ignore set.
#[derive(Clone, Debug, Default)]
pub struct Filters {
    include: PatternSet,
    exclude: PatternSet,
    defaults: PatternSet,
}

impl Filters {
    pub fn compile(config: &PipelineConfig, request: &DigestRequest) -> Result<Self, DigestError> {
        let invalid = |e: PatternError| DigestError::InvalidRequest(e.to_string());
        Ok(Self {
            include: PatternSet::compile(&request.include).map_err(invalid)?,
            exclude: PatternSet::compile(&request.exclude).map_err(invalid)?,
            defaults: PatternSet::compile(&config.default_ignore).map_err(invalid)?,
        })
    }

    /// Verdict for a text file within the size ceiling.
    fn verdict(&self, path: &str) -> Verdict {
        let included_by_user = !self.include.is_empty() && self.include.matches(path);
        if self.exclude.matches(path) {
            Verdict::Excluded(ExclusionReason::UserPattern)
        } else if self.defaults.matches(path) && !included_by_user {
            Verdict::Excluded(ExclusionReason::DefaultIgnore)
        } else if !self.include.is_empty() && !included_by_user {
            Verdict::Excluded(ExclusionReason::NotIncluded)
        } else {
            Verdict::Included
        }
    }

    /// Directories that are not entered at all.
    fn prunes(&self, dir: &str) -> bool {
        self.exclude.matches(dir) || (self.include.is_empty() && self.defaults.matches(dir))
    }
}

/// Rough token count: four tokens per three whitespace-delimited words.
pub fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as u64;
    (words * 4 + 2) / 3
}

/// True when the sample looks binary: any NUL byte, or more than `threshold`
/// of the bytes are non-printable control characters.
pub fn is_binary_sample(sample: &[u8], threshold: f64) -> bool {
    if sample.is_empty() {
        return false;
    }
    if sample.contains(&0) {
        return true;
    }
    let non_printable = sample
        .iter()
        .filter(|&&b| (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x08 | 0x1b)) || b == 0x7f)
        .count();
    non_printable as f64 / sample.len() as f64 > threshold
}

fn read_sample(path: &Path, len: usize) -> io::Result<Vec<u8>> {
    let mut sample = Vec::with_capacity(len);
    File::open(path)?.take(len as u64).read_to_end(&mut sample)?;
    Ok(sample)
}

/// Enumerate and classify every file under `root`.
pub fn walk(
    root: &Path,
    config: &PipelineConfig,
    filters: &Filters,
    notifier: &ProgressNotifier,
    cancel: &CancellationToken,
) -> Result<Vec<FileEntry>, DigestError> {
    let canonical_root = fs::canonicalize(root).map_err(|e| {
        DigestError::InternalError(format!("cannot resolve workspace {}: {e}", root.display()))
    })?;
    info!(path = %root.display(), "Walking repository tree");
    notifier.emit(Stage::Walking, "Scanning repository tree...");

    let mut state = WalkState {
        root: canonical_root.clone(),
        config,
        filters,
        notifier,
        cancel,
        visited: HashSet::from([canonical_root]),
        entries: Vec::new(),
        files_seen: 0,
    };
    state.visit_dir(root, "", 0)?;

    let mut entries = state.entries;
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut included = 0usize;
    for entry in entries.iter_mut().filter(|e| e.is_included()) {
        included += 1;
        if included > config.max_files {
            entry.verdict = Verdict::Excluded(ExclusionReason::FileLimit);
            entry.token_estimate = 0;
        }
    }
    if included > config.max_files {
        warn!(
            included,
            limit = config.max_files,
            "File count limit reached, excess files excluded"
        );
    }

    let kept = entries.iter().filter(|e| e.is_included()).count();
    info!(files = entries.len(), included = kept, "Completed walking repository tree");
    notifier.emit(
        Stage::Walking,
        format!("Scanned {} files, {} included.", entries.len(), kept),
    );
    Ok(entries)
}

struct WalkState<'a> {
    root: PathBuf,
    config: &'a PipelineConfig,
    filters: &'a Filters,
    notifier: &'a ProgressNotifier,
    cancel: &'a CancellationToken,
    visited: HashSet<PathBuf>,
    entries: Vec<FileEntry>,
    files_seen: usize,
}

impl WalkState<'_> {
    fn visit_dir(&mut self, dir: &Path, rel: &str, depth: usize) -> Result<(), DigestError> {
        let read = match fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) if rel.is_empty() => {
                return Err(DigestError::InternalError(format!(
                    "cannot read workspace: {e}"
                )));
            }
            Err(e) => {
                warn!(error = ?e, path = %dir.display(), "Skipping unreadable directory");
                self.entries.push(FileEntry::excluded(
                    rel.to_string(),
                    0,
                    false,
                    ExclusionReason::Unreadable(e.to_string()),
                ));
                return Ok(());
            }
        };

        let mut children = Vec::new();
        for entry in read {
            match entry {
                Ok(entry) => children.push(entry),
                Err(e) => warn!(error = ?e, path = %dir.display(), "Skipping unreadable directory entry"),
            }
        }
        children.sort_by_key(|entry| entry.file_name());

        for child in children {
            if self.cancel.is_cancelled() {
                return Err(DigestError::Cancelled);
            }
            let name = child.file_name().to_string_lossy().into_owned();
            if name == ".git" {
                continue;
            }
            let rel_path = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };
            let path = child.path();

            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    self.record_unreadable(rel_path, &e);
                    continue;
                }
            };
            let meta = if meta.file_type().is_symlink() {
                match self.follow_link(&path) {
                    Some(target) => target,
                    None => {
                        debug!(path = %path.display(), "Not following symlink");
                        self.entries.push(FileEntry::excluded(
                            rel_path,
                            0,
                            false,
                            ExclusionReason::Symlink,
                        ));
                        continue;
                    }
                }
            } else {
                meta
            };

            if meta.is_dir() {
                if depth + 1 > self.config.max_depth {
                    debug!(path = %path.display(), max_depth = self.config.max_depth, "Depth ceiling reached");
                    continue;
                }
                if self.filters.prunes(&rel_path) {
                    debug!(path = %rel_path, "Skipping directory");
                    continue;
                }
                let canonical = match fs::canonicalize(&path) {
                    Ok(c) => c,
                    Err(e) => {
                        self.record_unreadable(rel_path, &e);
                        continue;
                    }
                };
                if !self.visited.insert(canonical) {
                    debug!(path = %path.display(), "Directory already visited, not re-entering");
                    continue;
                }
                self.visit_dir(&path, &rel_path, depth + 1)?;
            } else if meta.is_file() {
                let entry = self.classify(&path, rel_path, meta.len());
                self.entries.push(entry);
                self.files_seen += 1;
                let batch = self.config.walk_event_batch.max(1);
                if self.files_seen % batch == 0 {
                    self.notifier.emit(
                        Stage::Walking,
                        format!("Scanned {} files...", self.files_seen),
                    );
                }
            }
        }
        Ok(())
    }

    /// Metadata of a symlink's target, if it resolves inside the workspace.
    /// Resolves a link that stays inside the workspace and out of any `.git` directory.
    fn follow_link(&self, path: &Path) -> Option<Metadata> {
        let target = fs::canonicalize(path).ok()?;
        let inner = target.strip_prefix(&self.root).ok()?;
        if inner.components().any(|c| c.as_os_str() == ".git") {
            return None;
        }
        fs::metadata(&target).ok()
    }

    fn record_unreadable(&mut self, rel_path: String, e: &io::Error) {
        warn!(error = ?e, path = %rel_path, "Skipping unreadable entry");
        self.entries.push(FileEntry::excluded(
            rel_path,
            0,
            false,
            ExclusionReason::Unreadable(e.to_string()),
        ));
    }

    fn classify(&self, path: &Path, rel_path: String, size: u64) -> FileEntry {
        let sample = match read_sample(path, self.config.binary_sample_size) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = ?e, path = %rel_path, "Failed to sample file");
                return FileEntry::excluded(rel_path, size, false, ExclusionReason::Unreadable(e.to_string()));
            }
        };
        let binary = is_binary_sample(&sample, self.config.binary_threshold);

        let verdict = if size > self.config.max_file_size {
            Verdict::Excluded(ExclusionReason::SizeCap)
        } else if binary {
            Verdict::Excluded(ExclusionReason::Binary)
        } else {
            self.filters.verdict(&rel_path)
        };

        if let Verdict::Excluded(reason) = verdict {
            debug!(path = %rel_path, %reason, "Excluded file");
            return FileEntry::excluded(rel_path, size, binary, reason);
        }

        match fs::read(path) {
            Ok(bytes) => FileEntry {
                token_estimate: estimate_tokens(&String::from_utf8_lossy(&bytes)),
                path: rel_path,
                size,
                binary,
                verdict: Verdict::Included,
            },
            Err(e) => {
                warn!(error = ?e, path = %rel_path, "Failed to read file");
                FileEntry::excluded(rel_path, size, binary, ExclusionReason::Unreadable(e.to_string()))
            }
        }
    }
}
