// Integration tests for the digestion pipeline.
// The acquirer is mocked: each test writes a small fixture tree straight into the workspace.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gitscape_core::contract::{Acquirer, MockAcquirer, RepositoryMetadata};
use gitscape_core::progress::{
    CollectingSink, DiscardSink, ProgressEvent, ProgressNotifier, ProgressSink,
};
use gitscape_core::workspace::Workspace;
use gitscape_core::walk::estimate_tokens;
use gitscape_core::{Budget, DigestError, DigestRequest, Pipeline, PipelineConfig, Stage};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

type Fixture = Vec<(&'static str, Vec<u8>)>;

fn readme_and_logo() -> Fixture {
    let readme = format!("# Fixture\n{}\n", "a".repeat(39));
    assert_eq!(readme.len(), 50);
    let mut logo = b"\x89PNG\r\n\x1a\n".to_vec();
    logo.resize(200_000, 0);
    vec![("README.md", readme.into_bytes()), ("logo.png", logo)]
}

fn acquirer_writing(files: Fixture) -> MockAcquirer {
    let mut acquirer = MockAcquirer::new();
    acquirer
        .expect_acquire()
        .returning(move |request, workspace, notifier, _cancel| {
            notifier.emit(Stage::Cloning, "Cloning fixture...");
            for (path, bytes) in &files {
                let target = workspace.path().join(path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(target, bytes).unwrap();
            }
            notifier.emit(Stage::Cloned, "Fixture ready.");
            Ok(RepositoryMetadata {
                name: "fixture".into(),
                url: request.url.clone(),
                reference: request.reference.clone(),
                commit: Some("0123456789abcdef".into()),
                size_bytes: 0,
            })
        });
    acquirer
}

fn pipeline(acquirer: MockAcquirer) -> (Pipeline<MockAcquirer>, TempDir) {
    let root = tempdir().unwrap();
    let config = PipelineConfig {
        workspace_root: root.path().join("workspaces"),
        ..PipelineConfig::default()
    };
    (Pipeline::new(Arc::new(config), acquirer), root)
}

fn leftover_workspaces(root: &Path) -> usize {
    fs::read_dir(root.join("workspaces"))
        .map(|dir| dir.count())
        .unwrap_or(0)
}

fn request() -> DigestRequest {
    DigestRequest::new("https://example.com/acme/fixture.git")
}

fn assert_ordered(events: &[ProgressEvent]) {
    for pair in events.windows(2) {
        assert!(
            pair[0].sequence < pair[1].sequence,
            "sequence must strictly increase: {:?}",
            events
        );
        assert!(pair[0].stage <= pair[1].stage, "stage went backwards: {:?}", events);
    }
}

#[tokio::test]
async fn test_readme_and_binary_logo_within_budget() {
    let (pipeline, root) = pipeline(acquirer_writing(readme_and_logo()));
    let req = request()
        .with_exclude(["*.png"])
        .with_budget(Budget::Bytes(1000));

    let digest = pipeline
        .run(req, Arc::new(DiscardSink), CancellationToken::new())
        .await
        .expect("digest should succeed");

    assert_eq!(digest.files.len(), 1);
    assert_eq!(digest.files[0].path, "README.md");
    assert!(!digest.summary.truncated);
    assert_eq!(digest.summary.skipped_for_budget, 0);
    assert!(digest.tree.contains("README.md"));
    assert!(digest.tree.contains("logo.png [excluded: binary]"));
    assert!(digest.tree.len() as u64 + digest.summary.total_size <= 1000);
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn test_tiny_budget_truncates_without_partial_files() {
    let (pipeline, root) = pipeline(acquirer_writing(readme_and_logo()));
    let req = request()
        .with_exclude(["*.png"])
        .with_budget(Budget::Bytes(10));

    let digest = pipeline
        .run(req, Arc::new(DiscardSink), CancellationToken::new())
        .await
        .expect("digest should succeed");

    assert!(digest.files.is_empty());
    assert!(digest.summary.truncated);
    assert_eq!(digest.summary.skipped_for_budget, 1);
    assert_eq!(digest.summary.file_count, 0);
    assert_eq!(digest.content(), "");
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let files: Fixture = vec![
        ("src/main.rs", b"fn main() {}\n".to_vec()),
        ("src/lib.rs", b"pub fn lib() {}\n".to_vec()),
        ("Cargo.toml", b"[package]\nname = \"x\"\n".to_vec()),
        ("docs/guide.md", b"# Guide\n".to_vec()),
        ("node_modules/dep/index.js", b"module.exports = 1;\n".to_vec()),
    ];
    let (pipeline, _root) = pipeline(acquirer_writing(files));

    let first = pipeline
        .run(request(), Arc::new(DiscardSink), CancellationToken::new())
        .await
        .unwrap();
    let second = pipeline
        .run(request(), Arc::new(DiscardSink), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.tree, second.tree);
    assert_eq!(first.files, second.files);
    assert!(!first.tree.contains("node_modules"));
    let paths: Vec<&str> = first.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["Cargo.toml", "docs/guide.md", "src/lib.rs", "src/main.rs"]
    );
}

#[tokio::test]
async fn test_root_documentation_comes_first() {
    let files: Fixture = vec![
        ("a.rs", b"// a\n".to_vec()),
        ("LICENSE", b"MIT\n".to_vec()),
        ("readme.md", b"# Readme\n".to_vec()),
        ("docs/README.md", b"# Docs\n".to_vec()),
        ("CONTRIBUTING.md", b"Be nice.\n".to_vec()),
    ];
    let (pipeline, _root) = pipeline(acquirer_writing(files));

    let digest = pipeline
        .run(request(), Arc::new(DiscardSink), CancellationToken::new())
        .await
        .unwrap();

    let paths: Vec<&str> = digest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["readme.md", "CONTRIBUTING.md", "LICENSE", "a.rs", "docs/README.md"]
    );
    let markdown = digest.to_markdown();
    assert!(markdown.starts_with("# Repository Digest for https://example.com/acme/fixture.git"));
    assert!(markdown.contains("## readme.md\n\n# Readme\n"));
}

#[tokio::test]
async fn test_exclude_everything_yields_empty_content() {
    let (pipeline, _root) = pipeline(acquirer_writing(vec![
        ("a.txt", b"alpha\n".to_vec()),
        ("nested/b.txt", b"beta\n".to_vec()),
    ]));

    let digest = pipeline
        .run(
            request().with_exclude(["*"]),
            Arc::new(DiscardSink),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(digest.summary.file_count, 0);
    assert!(digest.files.is_empty());
    assert!(!digest.summary.truncated);
    assert_eq!(digest.summary.total_size, 0);
    assert_eq!(digest.tree, "fixture/\n└── a.txt [excluded: excluded by pattern]\n");
}

#[tokio::test]
async fn test_token_budget_bounds_estimated_tokens() {
    let files: Fixture = (0..10)
        .map(|i| {
            let path: &'static str = Box::leak(format!("file{i:02}.txt").into_boxed_str());
            (path, "word ".repeat(30).into_bytes())
        })
        .collect();
    let (pipeline, _root) = pipeline(acquirer_writing(files));

    let digest = pipeline
        .run(
            request().with_budget(Budget::Tokens(150)),
            Arc::new(DiscardSink),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let used: u64 = estimate_tokens(&digest.tree)
        + digest
            .files
            .iter()
            .map(|b| estimate_tokens(&b.render()))
            .sum::<u64>();
    assert!(used <= 150, "used {used} tokens");
    assert!(digest.summary.truncated);
    assert!(!digest.files.is_empty());
    assert_eq!(
        digest.files.len() + digest.summary.skipped_for_budget,
        10
    );
}

#[tokio::test]
async fn test_progress_events_are_ordered_and_end_with_done() {
    let (pipeline, _root) = pipeline(acquirer_writing(readme_and_logo()));
    let sink = Arc::new(CollectingSink::new());

    pipeline
        .run(request(), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    let events = sink.events();
    assert_ordered(&events);
    assert_eq!(events[0].stage, Stage::Queued);
    assert_eq!(events[0].sequence, 1);
    let stages = sink.stages();
    for stage in [
        Stage::Cloning,
        Stage::Cloned,
        Stage::Walking,
        Stage::Assembling,
    ] {
        assert!(stages.contains(&stage), "missing {stage:?} in {stages:?}");
    }
    assert_eq!(stages.last(), Some(&Stage::Done));
}

#[tokio::test]
async fn test_ref_not_found_fails_before_walking() {
    let mut acquirer = MockAcquirer::new();
    acquirer
        .expect_acquire()
        .times(1)
        .returning(|_, _, notifier, _| {
            notifier.emit(Stage::Cloning, "Cloning...");
            Err(DigestError::RefNotFound("no-such-branch".into()))
        });
    let (pipeline, root) = pipeline(acquirer);
    let sink = Arc::new(CollectingSink::new());

    let err = pipeline
        .run(
            request().with_reference("no-such-branch"),
            sink.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DigestError::RefNotFound(ref r) if r == "no-such-branch"));
    assert_eq!(
        sink.stages(),
        vec![Stage::Queued, Stage::Cloning, Stage::Error]
    );
    assert_ordered(&sink.events());
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn test_invalid_pattern_is_rejected_before_acquisition() {
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().times(0);
    let (pipeline, root) = pipeline(acquirer);

    let err = pipeline
        .run(
            request().with_include(["re:("]),
            Arc::new(DiscardSink),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DigestError::InvalidRequest(_)));
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn test_local_urls_are_rejected_unless_allowed() {
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().times(0);
    let (pipeline, root) = pipeline(acquirer);
    let sink = Arc::new(CollectingSink::new());

    let err = pipeline
        .run(
            DigestRequest::new("file:///etc/secrets.git"),
            sink.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DigestError::InvalidRequest(_)));
    assert_eq!(sink.stages(), vec![Stage::Queued, Stage::Error]);
    assert_eq!(leftover_workspaces(root.path()), 0);

    let root = tempdir().unwrap();
    let config = PipelineConfig {
        workspace_root: root.path().join("workspaces"),
        allow_local_urls: true,
        ..PipelineConfig::default()
    };
    let allowed = Pipeline::new(
        Arc::new(config),
        acquirer_writing(vec![("README.md", b"# Local\n".to_vec())]),
    );
    let digest = allowed
        .run(
            DigestRequest::new("file:///srv/repo.git"),
            Arc::new(DiscardSink),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(digest.summary.file_count, 1);
}

/// Cancels the operation as soon as a given stage is reported.
struct CancelOnStage {
    stage: Stage,
    token: CancellationToken,
    inner: CollectingSink,
}

impl ProgressSink for CancelOnStage {
    fn report(&self, event: ProgressEvent) {
        if event.stage == self.stage {
            self.token.cancel();
        }
        self.inner.report(event);
    }
}

#[tokio::test]
async fn test_cancel_during_walk_disposes_workspace() {
    let files: Fixture = (0..50)
        .map(|i| {
            let path: &'static str = Box::leak(format!("src/m{i:02}.rs").into_boxed_str());
            (path, b"pub fn f() {}\n".to_vec())
        })
        .collect();
    let (pipeline, root) = pipeline(acquirer_writing(files));
    let token = CancellationToken::new();
    let sink = Arc::new(CancelOnStage {
        stage: Stage::Walking,
        token: token.clone(),
        inner: CollectingSink::new(),
    });

    let err = pipeline
        .run(request(), sink.clone(), token)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    let stages = sink.inner.stages();
    assert_eq!(stages.last(), Some(&Stage::Cancelled));
    assert!(!stages.contains(&Stage::Assembling));
    assert!(!stages.contains(&Stage::Done));
    assert_ordered(&sink.inner.events());
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn test_cancel_before_start_never_acquires() {
    let mut acquirer = MockAcquirer::new();
    acquirer.expect_acquire().times(0);
    let (pipeline, root) = pipeline(acquirer);
    let token = CancellationToken::new();
    token.cancel();
    let sink = Arc::new(CollectingSink::new());

    let err = pipeline.run(request(), sink.clone(), token).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(sink.stages(), vec![Stage::Queued, Stage::Cancelled]);
    assert_eq!(leftover_workspaces(root.path()), 0);
}

/// Keeps writing into the workspace for a moment after cancellation, the way a
/// killed git process may, and records when it has fully stopped.
struct SlowToStopAcquirer {
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl Acquirer for SlowToStopAcquirer {
    async fn acquire(
        &self,
        _request: &DigestRequest,
        workspace: &Workspace,
        notifier: &ProgressNotifier,
        cancel: &CancellationToken,
    ) -> Result<RepositoryMetadata, DigestError> {
        let objects = workspace.path().join(".git/objects");
        fs::create_dir_all(&objects).unwrap();
        notifier.emit(Stage::Cloning, "Cloning...");
        cancel.cancelled().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(objects.join("pack-tail"), "late write").unwrap();
        self.stopped.store(true, Ordering::SeqCst);
        Err(DigestError::Cancelled)
    }
}

#[tokio::test]
async fn test_cancel_during_fetch_waits_for_acquirer_before_disposal() {
    let stopped = Arc::new(AtomicBool::new(false));
    let root = tempdir().unwrap();
    let config = PipelineConfig {
        workspace_root: root.path().join("workspaces"),
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(
        Arc::new(config),
        SlowToStopAcquirer {
            stopped: stopped.clone(),
        },
    );
    let token = CancellationToken::new();
    let sink = Arc::new(CancelOnStage {
        stage: Stage::Cloning,
        token: token.clone(),
        inner: CollectingSink::new(),
    });

    let err = pipeline
        .run(request(), sink.clone(), token)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(stopped.load(Ordering::SeqCst));
    assert_eq!(
        sink.inner.stages(),
        vec![Stage::Queued, Stage::Cloning, Stage::Cancelled]
    );
    assert_eq!(leftover_workspaces(root.path()), 0);
}
