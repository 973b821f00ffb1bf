//! # contract: request/response types and the acquisition seam
//!
//! This module holds the data that flows into and out of the pipeline and the
//! [`Acquirer`] trait that separates "get the repository onto disk" from the
//! rest of the work.
//!
//! ## Mocking & Testing
//! - The trait is annotated for `mockall`; with the `test-export-mocks`
//!   feature (on by default) `MockAcquirer` is exported so integration tests
//!   can populate a workspace without touching the network.
//!
//! ## Secrets
//! - The request's token is a [`SecretString`]: its `Debug` output is
//!   redacted and it can only be read through `ExposeSecret`.

use async_trait::async_trait;
use mockall::automock;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::DigestError;
use crate::pattern::PatternRule;
use crate::progress::ProgressNotifier;
use crate::workspace::Workspace;

/// Upper bound on the content section of a digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    /// Rendered bytes.
    Bytes(u64),
    /// Estimated tokens.
    Tokens(u64),
}

impl Budget {
    pub fn limit(&self) -> u64 {
        match self {
            Budget::Bytes(n) | Budget::Tokens(n) => *n,
        }
    }
}

/// A validated request to digest one repository.
#[derive(Debug, Deserialize)]
pub struct DigestRequest {
    /// Remote URL (`https://`, `ssh://`, `git@host:path`, `file://`).
    #[serde(alias = "repo_url")]
    pub url: String,
    /// Branch, tag or commit; the remote's default branch when absent.
    #[serde(default, alias = "ref")]
    pub reference: Option<String>,
    /// Used only for the transfer; never persisted or logged.
    #[serde(default, alias = "github_token", deserialize_with = "deserialize_token")]
    pub token: Option<SecretString>,
    #[serde(default)]
    pub include: Vec<PatternRule>,
    #[serde(default)]
    pub exclude: Vec<PatternRule>,
    #[serde(default)]
    pub budget: Option<Budget>,
    /// Restrict the checkout to one directory of the repository.
    #[serde(default)]
    pub subpath: Option<String>,
}

fn deserialize_token<'de, D>(d: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.filter(|t| !t.is_empty()).map(SecretString::from))
}

const ALLOWED_SCHEMES: &[&str] = &["https://", "http://", "ssh://", "git://", "file://"];

impl DigestRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reference: None,
            token: None,
            include: Vec::new(),
            exclude: Vec::new(),
            budget: None,
            subpath: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self
    }

    pub fn with_include<I, P>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PatternRule>,
    {
        self.include = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude<I, P>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PatternRule>,
    {
        self.exclude = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_subpath(mut self, subpath: impl Into<String>) -> Self {
        self.subpath = Some(subpath.into());
        self
    }

    /// Whether the URL names a repository on this machine's filesystem.
    pub fn is_local(&self) -> bool {
        self.url.trim_start().starts_with("file://")
    }

    /// Rejects requests that must not reach the acquirer.
    pub fn validate(&self) -> Result<(), DigestError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(DigestError::InvalidRequest("repository url is empty".into()));
        }
        let scp_like = !url.contains("://")
            && url
                .split_once(':')
                .is_some_and(|(host, _)| host.contains('@') && !host.contains('/'));
        if !scp_like && !ALLOWED_SCHEMES.iter().any(|s| url.starts_with(s)) {
            return Err(DigestError::InvalidRequest(format!(
                "unsupported repository url: {}",
                redact_url(url)
            )));
        }
        if url.starts_with('-') || url.chars().any(char::is_whitespace) {
            return Err(DigestError::InvalidRequest("malformed repository url".into()));
        }
        if let Some(reference) = &self.reference {
            if reference.is_empty() || reference.starts_with('-') || reference.contains("..") {
                return Err(DigestError::InvalidRequest(format!(
                    "invalid ref: {reference:?}"
                )));
            }
        }
        if let Some(subpath) = &self.subpath {
            let trimmed = subpath.trim_matches('/');
            if trimmed.is_empty()
                || subpath.starts_with('/')
                || trimmed.split('/').any(|c| c == ".." || c == ".")
            {
                return Err(DigestError::InvalidRequest(format!(
                    "invalid subpath: {subpath:?}"
                )));
            }
        }
        if self.budget.is_some_and(|b| b.limit() == 0) {
            return Err(DigestError::InvalidRequest("budget must be positive".into()));
        }
        Ok(())
    }
}

/// What the acquirer learned about the repository it fetched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RepositoryMetadata {
    pub name: String,
    pub url: String,
    pub reference: Option<String>,
    pub commit: Option<String>,
    pub size_bytes: u64,
}

/// `https://github.com/owner/repo.git/` -> `repo`, `git@host:owner/repo` -> `repo`.
pub fn repository_name(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "repository".to_string()
    } else {
        name.to_string()
    }
}

/// Drops any `user:password@` part so a URL is safe to log.
pub fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            match authority.rsplit_once('@') {
                Some((_, host)) => format!("{scheme}://***@{host}/{path}"),
                None => url.to_string(),
            }
        }
        None => url.to_string(),
    }
}

/// Fetches a repository into a workspace.
/// Allows plugging in the real git-backed acquirer or a mock.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Acquirer: Send + Sync {
    /// Populate `workspace` with the requested ref of `request.url`.
    ///
    /// Implementations report `cloning`/`cloned` through `notifier` and must
    /// stop promptly, returning [`DigestError::Cancelled`], once `cancel` fires.
    async fn acquire(
        &self,
        request: &DigestRequest,
        workspace: &Workspace,
        notifier: &ProgressNotifier,
        cancel: &CancellationToken,
    ) -> Result<RepositoryMetadata, DigestError>;
}
