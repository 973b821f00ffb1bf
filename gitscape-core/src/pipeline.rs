//! One digestion operation from request to [`Digest`].
//!
//! Stages run strictly in sequence: validate, wait for admission, acquire a
//! workspace, fetch, walk, assemble. Walking and assembly are synchronous filesystem work and
//! run on the blocking pool so the calling task can keep watching for
//! disconnects. The workspace is disposed on every exit path before the
//! outcome is returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acquire::GitAcquirer;
use crate::assemble::{assemble, Digest};
use crate::config::PipelineConfig;
use crate::contract::{redact_url, Acquirer, Budget, DigestRequest};
use crate::error::DigestError;
use crate::progress::{ProgressNotifier, ProgressSink, Stage};
use crate::walk::{walk, Filters};
use crate::workspace::{Workspace, WorkspaceManager};

pub struct Pipeline<A> {
    config: Arc<PipelineConfig>,
    acquirer: A,
    workspaces: WorkspaceManager,
}

impl Pipeline<GitAcquirer> {
    /// A pipeline that fetches with the system `git`.
    pub fn git(config: Arc<PipelineConfig>) -> Self {
        let acquirer = GitAcquirer::new(config.clone());
        Self::new(config, acquirer)
    }
}

impl<A: Acquirer> Pipeline<A> {
    pub fn new(config: Arc<PipelineConfig>, acquirer: A) -> Self {
        let workspaces = WorkspaceManager::new(config.workspace_root.clone());
        Self {
            config,
            acquirer,
            workspaces,
        }
    }

    /// Digest one repository, reporting progress to `sink`.
    ///
    /// A failed run ends its event stream with `error`, a cancelled one with
    /// `cancelled`; neither yields a digest.
    pub async fn run(
        &self,
        request: DigestRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<Digest, DigestError> {
        self.run_admitted(request, sink, cancel, async { Ok::<_, DigestError>(()) })
            .await
    }

    /// Like [`Pipeline::run`], but waits on `admission` once the request is
    /// queued and validated. Whatever `admission` yields is held until the
    /// run ends.
    pub async fn run_admitted<P>(
        &self,
        request: DigestRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
        admission: impl Future<Output = Result<P, DigestError>>,
    ) -> Result<Digest, DigestError> {
        let notifier = Arc::new(ProgressNotifier::new(sink));
        let started = Instant::now();
        let result = self
            .execute(&request, &notifier, &cancel, admission)
            .await;

        match &result {
            Ok(digest) => info!(
                repo_url = %redact_url(&request.url),
                files = digest.summary.file_count,
                truncated = digest.summary.truncated,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Digestion complete"
            ),
            Err(DigestError::Cancelled) => {
                info!(repo_url = %redact_url(&request.url), "Digestion cancelled");
                notifier.emit(Stage::Cancelled, "Operation cancelled.");
            }
            Err(e) => {
                error!(repo_url = %redact_url(&request.url), kind = ?e.kind(), error = %e, "Digestion failed");
                notifier.emit(Stage::Error, e.to_string());
            }
        }
        result
    }

    async fn execute<P>(
        &self,
        request: &DigestRequest,
        notifier: &Arc<ProgressNotifier>,
        cancel: &CancellationToken,
        admission: impl Future<Output = Result<P, DigestError>>,
    ) -> Result<Digest, DigestError> {
        notifier.emit(Stage::Queued, "Queued for processing.");
        request.validate()?;
        if request.is_local() && !self.config.allow_local_urls {
            return Err(DigestError::InvalidRequest(
                "local repository urls are not allowed".into(),
            ));
        }
        let filters = Arc::new(Filters::compile(&self.config, request)?);
        let budget = request.budget.unwrap_or(self.config.default_budget);
        let _admitted = admission.await?;
        live(cancel)?;

        let workspace = self.workspaces.acquire()?;
        let outcome = self
            .digest_in(&workspace, request, filters, budget, notifier, cancel)
            .await;
        if let Err(e) = self.workspaces.dispose(&workspace) {
            warn!(error = ?e, path = %workspace.path().display(), "Workspace not fully removed");
        }
        outcome
    }

    async fn digest_in(
        &self,
        workspace: &Workspace,
        request: &DigestRequest,
        filters: Arc<Filters>,
        budget: Budget,
        notifier: &Arc<ProgressNotifier>,
        cancel: &CancellationToken,
    ) -> Result<Digest, DigestError> {
        // The acquirer observes `cancel` itself so any child process is reaped
        // before the workspace is removed.
        let metadata = self
            .acquirer
            .acquire(request, workspace, notifier, cancel)
            .await?;
        live(cancel)?;

        let root = workspace.path().to_path_buf();
        let entries = {
            let (root, config, notifier, cancel) =
                (root.clone(), self.config.clone(), notifier.clone(), cancel.clone());
            tokio::task::spawn_blocking(move || walk(&root, &config, &filters, &notifier, &cancel))
                .await??
        };
        live(cancel)?;

        let (config, notifier, cancel) = (self.config.clone(), notifier.clone(), cancel.clone());
        tokio::task::spawn_blocking(move || {
            assemble(&entries, &root, &metadata, budget, &config, &notifier, &cancel)
        })
        .await?
    }
}

fn live(cancel: &CancellationToken) -> Result<(), DigestError> {
    if cancel.is_cancelled() {
        Err(DigestError::Cancelled)
    } else {
        Ok(())
    }
}
