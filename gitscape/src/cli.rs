/// # gitscape CLI Interface (Module)
///
/// Command parsing and the entrypoints behind each subcommand. All digestion
/// logic lives in `gitscape-core`; this module only builds configuration,
/// wires a progress sink and decides where output goes.
///
/// ## Subcommands
/// - `serve`: run the HTTP/WebSocket service until Ctrl-C.
/// - `digest`: digest one repository and print the markdown (or JSON).
///
/// For programmatic and integration use, call [`run`] with a constructed [`Cli`].
use crate::load_config::load_config;
use crate::server;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use gitscape_core::progress::TracingSink;
use gitscape_core::{Budget, DigestRequest, PatternRule, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// CLI for gitscape: turn a git repository into one text digest.
#[derive(Parser)]
#[clap(
    name = "gitscape",
    version,
    about = "Digest a git repository into a single budget-bounded text document"
)]
pub struct Cli {
    /// Path to a YAML config file
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP and WebSocket interfaces
    Serve {
        /// Override the configured listen address
        #[clap(long)]
        host: Option<String>,
        /// Override the configured port
        #[clap(long)]
        port: Option<u16>,
    },
    /// Digest one repository and write the result
    Digest(DigestArgs),
}

#[derive(Args, Debug)]
pub struct DigestArgs {
    /// Repository URL (https, ssh, git@host:path or file://)
    pub url: String,
    /// Branch, tag or commit to digest
    #[clap(long = "ref")]
    pub reference: Option<String>,
    /// Include patterns (glob, `re:<regex>` or `builtin:<tag>`), comma-separated or repeated
    #[clap(long, value_delimiter = ',')]
    pub include: Vec<String>,
    /// Exclude patterns, same syntax as --include
    #[clap(long, value_delimiter = ',')]
    pub exclude: Vec<String>,
    /// Content budget in bytes
    #[clap(long, conflicts_with = "max_tokens")]
    pub max_bytes: Option<u64>,
    /// Content budget in estimated tokens
    #[clap(long)]
    pub max_tokens: Option<u64>,
    /// Only digest this directory of the repository
    #[clap(long)]
    pub subpath: Option<String>,
    /// Write to this file instead of stdout
    #[clap(long, short)]
    pub output: Option<PathBuf>,
    /// Emit the digest as JSON instead of markdown
    #[clap(long)]
    pub json: bool,
}

impl DigestArgs {
    fn into_request(self) -> DigestRequest {
        let mut request = DigestRequest::new(self.url)
            .with_include(self.include.iter().map(|p| PatternRule::parse(p)))
            .with_exclude(self.exclude.iter().map(|p| PatternRule::parse(p)));
        request.reference = self.reference;
        request.subpath = self.subpath;
        request.budget = match (self.max_bytes, self.max_tokens) {
            (Some(bytes), _) => Some(Budget::Bytes(bytes)),
            (None, Some(tokens)) => Some(Budget::Tokens(tokens)),
            (None, None) => None,
        };
        request
    }
}

/// Async CLI entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.trace_loaded();
            let handle = server::start(&config).await?;
            tracing::info!(command = "serve", port = handle.port, "Serving; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!(command = "serve", "Shutdown requested");
            handle.shutdown().await;
            Ok(())
        }
        Commands::Digest(args) => {
            config.trace_loaded();
            let output = args.output.clone();
            let json = args.json;
            let mut request = args.into_request();
            if request.token.is_none() {
                request.token = config.default_token.clone();
            }

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            // Local runs read with the caller's own permissions.
            config.pipeline.allow_local_urls = true;
            let pipeline = Pipeline::git(Arc::new(config.pipeline));
            let digest = match pipeline.run(request, Arc::new(TracingSink), cancel).await {
                Ok(digest) => digest,
                Err(e) => {
                    tracing::error!(command = "digest", kind = ?e.kind(), error = %e, "Digest failed");
                    return Err(anyhow::Error::new(e));
                }
            };

            let rendered = if json {
                serde_json::to_string_pretty(&digest)?
            } else {
                digest.to_markdown()
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)?;
                    tracing::info!(command = "digest", path = %path.display(), "Digest written");
                }
                None => println!("{rendered}"),
            }
            Ok(())
        }
    }
}
