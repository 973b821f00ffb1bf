//! Git-backed repository acquisition.
//!
//! The clone is built up step by step inside the workspace (`init`, `remote
//! add`, optional sparse pattern, shallow `fetch` of exactly one ref,
//! `checkout`) so that branches, tags and commit ids all go through the same
//! path. Every git invocation shares one deadline and one cancellation token;
//! when either fires the child process is killed.
//!
//! The token never appears in argv or in the clone's config: it is handed to
//! git through `GIT_CONFIG_*` environment variables as an
//! `http.extraHeader`, and only for the fetch step.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::contract::{redact_url, repository_name, Acquirer, DigestRequest, RepositoryMetadata};
use crate::error::DigestError;
use crate::progress::{ProgressNotifier, Stage};
use crate::workspace::Workspace;

/// Transfer percentages are reported in steps of this size.
const PROGRESS_STEP: u8 = 5;
/// Stderr lines kept for error classification.
const STDERR_TAIL: usize = 64;

/// [`Acquirer`] that shells out to `git`.
pub struct GitAcquirer {
    config: Arc<PipelineConfig>,
}

impl GitAcquirer {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Acquirer for GitAcquirer {
    async fn acquire(
        &self,
        request: &DigestRequest,
        workspace: &Workspace,
        notifier: &ProgressNotifier,
        cancel: &CancellationToken,
    ) -> Result<RepositoryMetadata, DigestError> {
        let dir = workspace.path();
        let url = request.url.trim();
        let target = request.reference.as_deref().unwrap_or("HEAD");
        let deadline = Instant::now() + self.config.acquisition_timeout;
        let run = GitRun {
            program: &self.config.git_program,
            cwd: dir,
            deadline,
            timeout: self.config.acquisition_timeout,
            cancel,
        };

        info!(
            repo_url = %redact_url(url),
            reference = target,
            path = %dir.display(),
            authenticated = request.token.is_some(),
            "Acquiring git repository"
        );
        notifier.emit_with_percentage(Stage::Cloning, "Starting repository clone...", 0);

        run.git(&["init", "--quiet"], None, None).await?;
        run.git(&["remote", "add", "origin", url], None, None).await?;

        if let Some(subpath) = &request.subpath {
            run.git(&["config", "core.sparseCheckout", "true"], None, None)
                .await?;
            write_sparse_pattern(dir, subpath)?;
        }

        let fetch = run
            .git(
                &["fetch", "--depth=1", "--no-tags", "--progress", "origin", target],
                request.token.as_ref(),
                Some(notifier),
            )
            .await;
        if let Err(e) = fetch {
            match &e {
                DigestError::Cancelled => info!(repo_url = %redact_url(url), "Fetch cancelled"),
                _ => error!(repo_url = %redact_url(url), reference = target, error = %e, "Fetch failed"),
            }
            return Err(match e {
                DigestError::RefNotFound(_) => DigestError::RefNotFound(target.to_string()),
                other => other,
            });
        }

        run.git(&["checkout", "--quiet", "--detach", "FETCH_HEAD"], None, None)
            .await?;
        let commit = run
            .git(&["rev-parse", "HEAD"], None, None)
            .await
            .map(|out| out.trim().to_string())
            .ok()
            .filter(|c| !c.is_empty());

        let measured = dir.to_path_buf();
        let size_bytes = tokio::task::spawn_blocking(move || checkout_size(&measured)).await?;
        if size_bytes > self.config.max_repo_size {
            warn!(
                size_bytes,
                limit = self.config.max_repo_size,
                "Repository exceeds size ceiling"
            );
            return Err(DigestError::TooLarge {
                size: size_bytes,
                limit: self.config.max_repo_size,
            });
        }

        info!(
            repo_url = %redact_url(url),
            reference = target,
            commit = ?commit,
            size_bytes,
            "Successfully cloned git repository"
        );
        notifier.emit_with_percentage(Stage::Cloned, "Repository cloned.", 100);

        Ok(RepositoryMetadata {
            name: repository_name(url),
            url: redact_url(url),
            reference: request.reference.clone(),
            commit,
            size_bytes,
        })
    }
}

/// Shared settings for every git invocation of one acquisition.
struct GitRun<'a> {
    program: &'a Path,
    cwd: &'a Path,
    deadline: Instant,
    timeout: std::time::Duration,
    cancel: &'a CancellationToken,
}

enum Outcome {
    Finished {
        status: std::io::Result<ExitStatus>,
        stdout: Vec<u8>,
        stderr: Vec<String>,
    },
    Cancelled,
    TimedOut,
}

impl GitRun<'_> {
    /// Run one git command to completion, returning its stdout.
    async fn git(
        &self,
        args: &[&str],
        token: Option<&SecretString>,
        progress: Option<&ProgressNotifier>,
    ) -> Result<String, DigestError> {
        if self.cancel.is_cancelled() {
            return Err(DigestError::Cancelled);
        }
        let step = args.first().copied().unwrap_or("git");
        let mut cmd = Command::new(self.program);
        cmd.args(args)
            .current_dir(self.cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GCM_INTERACTIVE", "never")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = token {
            let credentials = base64::engine::general_purpose::STANDARD
                .encode(format!("x-access-token:{}", token.expose_secret()));
            cmd.env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                .env(
                    "GIT_CONFIG_VALUE_0",
                    format!("Authorization: Basic {credentials}"),
                );
        }

        debug!(step, "Launching git");
        let mut child = cmd.spawn().map_err(|e| {
            error!(error = ?e, program = %self.program.display(), "Failed to launch git process");
            DigestError::TransportError(format!("failed to launch git: {e}"))
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = {
            let work = async {
                let (stdout, stderr) =
                    tokio::join!(read_all(stdout), read_stderr(stderr, progress));
                let status = child.wait().await;
                Outcome::Finished {
                    status,
                    stdout,
                    stderr,
                }
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Outcome::Cancelled,
                _ = tokio::time::sleep_until(self.deadline) => Outcome::TimedOut,
                finished = work => finished,
            }
        };

        match outcome {
            Outcome::Finished {
                status: Ok(status),
                stdout,
                ..
            } if status.success() => Ok(String::from_utf8_lossy(&stdout).into_owned()),
            Outcome::Finished {
                status: Ok(status),
                stderr,
                ..
            } => {
                let stderr = stderr.join("\n");
                debug!(step, %status, stderr = %stderr, "Git exited with non-zero code");
                Err(classify_git_failure(&stderr))
            }
            Outcome::Finished {
                status: Err(e), ..
            } => Err(DigestError::TransportError(format!("git {step} failed: {e}"))),
            Outcome::Cancelled => {
                let _ = child.kill().await;
                Err(DigestError::Cancelled)
            }
            Outcome::TimedOut => {
                let _ = child.kill().await;
                warn!(step, timeout = ?self.timeout, "Git exceeded acquisition timeout");
                Err(DigestError::AcquisitionTimeout(self.timeout))
            }
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

/// Read git's stderr, turning `Receiving objects: NN%` lines into progress
/// events and keeping the tail of everything else.
async fn read_stderr<R: AsyncRead + Unpin>(
    reader: Option<R>,
    progress: Option<&ProgressNotifier>,
) -> Vec<String> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut tail: Vec<String> = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut reported: Option<u8> = None;

    let mut handle_line = |line: &[u8], tail: &mut Vec<String>| {
        let line = String::from_utf8_lossy(line).trim().to_string();
        if line.is_empty() {
            return;
        }
        if let Some(pct) = transfer_percentage(&line) {
            let due = match reported {
                None => true,
                Some(last) => pct >= last.saturating_add(PROGRESS_STEP) || (pct == 100 && last < 100),
            };
            if due {
                if let Some(notifier) = progress {
                    notifier.emit_with_percentage(
                        Stage::Cloning,
                        format!("Receiving objects: {pct}%"),
                        pct,
                    );
                }
                reported = Some(pct);
            }
            return;
        }
        if tail.len() == STDERR_TAIL {
            tail.remove(0);
        }
        tail.push(line);
    };

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                handle_line(&pending, &mut tail);
                pending.clear();
            } else {
                pending.push(byte);
            }
        }
    }
    handle_line(&pending, &mut tail);
    tail
}

fn transfer_percentage(line: &str) -> Option<u8> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"Receiving objects:\s+(\d{1,3})%").expect("static regex is valid")
    });
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .map(|pct| pct.min(100))
}

/// Map git's stderr to a failure category.
pub fn classify_git_failure(stderr: &str) -> DigestError {
    let lower = stderr.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    let summary = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("git failed")
        .trim()
        .to_string();

    if any(&[
        "couldn't find remote ref",
        "no such remote ref",
        "not our ref",
        "unadvertised object",
        "invalid refspec",
    ]) {
        DigestError::RefNotFound(summary)
    } else if any(&[
        "authentication failed",
        "could not read username",
        "could not read password",
        "permission denied (publickey)",
        "returned error: 401",
        "returned error: 403",
    ]) {
        DigestError::Unauthorized(summary)
    } else if any(&[
        "could not resolve host",
        "repository not found",
        "does not appear to be a git repository",
        "returned error: 404",
        "not found",
    ]) {
        DigestError::NotFound(summary)
    } else {
        DigestError::TransportError(summary)
    }
}

fn write_sparse_pattern(dir: &Path, subpath: &str) -> Result<(), DigestError> {
    let info_dir = dir.join(".git").join("info");
    let pattern = format!("/{}/\n", subpath.trim_matches('/'));
    fs::create_dir_all(&info_dir)
        .and_then(|_| fs::write(info_dir.join("sparse-checkout"), pattern))
        .map_err(|e| {
            error!(error = ?e, path = %info_dir.display(), "Failed to write sparse-checkout pattern");
            DigestError::InternalError(format!("cannot configure sparse checkout: {e}"))
        })
}

/// Bytes of regular files in the checkout, excluding `.git`. Symlinks are not followed.
fn checkout_size(root: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if meta.is_dir() {
                if entry.file_name() != ".git" {
                    stack.push(entry.path());
                }
            } else if meta.is_file() {
                total = total.saturating_add(meta.len());
            }
        }
    }
    total
}
