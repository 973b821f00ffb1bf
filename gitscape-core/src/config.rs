use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contract::Budget;
use crate::pattern::PatternRule;

const MIB: u64 = 1024 * 1024;

/// Process-wide pipeline settings.
///
/// Built once at startup and handed to every stage behind an `Arc`; no stage
/// reads environment variables or other ambient state on its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory under which per-operation workspaces are created.
    pub workspace_root: PathBuf,
    /// The git executable to drive.
    pub git_program: PathBuf,
    #[serde(with = "duration_secs")]
    pub acquisition_timeout: Duration,
    /// Ceiling on the checked-out repository size, in bytes.
    pub max_repo_size: u64,
    /// Files above this many bytes are excluded with `SizeCap`.
    pub max_file_size: u64,
    /// Included files beyond this count (in path order) are excluded with `FileLimit`.
    pub max_files: usize,
    /// Directories nested deeper than this are not entered.
    pub max_depth: usize,
    /// Number of leading bytes sampled for binary detection.
    pub binary_sample_size: usize,
    /// Ratio of non-printable bytes above which a sample is binary.
    pub binary_threshold: f64,
    /// A `walking` progress event is emitted every this many files.
    pub walk_event_batch: usize,
    /// Budget applied when a request does not carry one.
    pub default_budget: Budget,
    /// Rules layered beneath user patterns.
    pub default_ignore: Vec<PatternRule>,
    /// Show excluded files, annotated, in the rendered tree.
    pub tree_show_excluded: bool,
    /// Accept `file://` repository URLs. Off for network-facing servers.
    pub allow_local_urls: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("gitscape"),
            git_program: PathBuf::from("git"),
            acquisition_timeout: Duration::from_secs(120),
            max_repo_size: 1000 * MIB,
            max_file_size: 15 * MIB,
            max_files: 15_000,
            max_depth: 40,
            binary_sample_size: 8192,
            binary_threshold: 0.30,
            walk_event_batch: 100,
            default_budget: Budget::Bytes(10 * MIB),
            default_ignore: PatternRule::defaults(),
            tree_show_excluded: true,
            allow_local_urls: false,
        }
    }
}

impl PipelineConfig {
    pub fn trace_loaded(&self) {
        info!(
            workspace_root = %self.workspace_root.display(),
            git = %self.git_program.display(),
            timeout_secs = self.acquisition_timeout.as_secs(),
            default_ignore_rules = self.default_ignore.len(),
            allow_local_urls = self.allow_local_urls,
            "Loaded PipelineConfig"
        );
        debug!(?self, "PipelineConfig loaded (full debug)");
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
