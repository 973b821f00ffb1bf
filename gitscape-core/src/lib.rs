#![doc = "gitscape-core: repository digestion pipeline for gitscape."]

//! This crate holds every stage of turning a remote git repository into a
//! single budget-bounded text digest: workspace management, acquisition,
//! walking and filtering, assembly and progress reporting. It knows nothing
//! about HTTP or WebSockets; transports live in the `gitscape` crate and
//! attach a [`progress::ProgressSink`] of their choosing.
//!
//! # Usage
//! Build a [`PipelineConfig`], wrap it in an `Arc`, create a
//! [`Pipeline`] and call [`Pipeline::run`] once per request.

pub mod acquire;
pub mod assemble;
pub mod config;
pub mod contract;
pub mod error;
pub mod pattern;
pub mod pipeline;
pub mod progress;
pub mod walk;
pub mod workspace;

pub use assemble::{ContentBlock, Digest, DigestSummary};
pub use config::PipelineConfig;
pub use contract::{Acquirer, Budget, DigestRequest, RepositoryMetadata};
pub use error::{DigestError, ErrorKind};
pub use pattern::PatternRule;
pub use pipeline::Pipeline;
pub use progress::{ProgressEvent, ProgressSink, Stage};
