//! `answerpipe` crate (library surface).
//!
//! The primary entrypoint for end users is the `answerpipe` binary. The library exists so the
//! pipeline can be embedded with custom adapters, fetchers and models, and so the contract tests
//! can drive it without network access.

pub use answerpipe_core as core;
pub use answerpipe_local as local;

pub mod config;
pub mod decide;
pub mod dispatch;
pub mod evidence;
pub mod orchestrate;
pub mod pipeline;
pub mod prompts;
pub mod select;
pub mod verify;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use orchestrate::LoopState;
pub use pipeline::{AnswerReport, Pipeline, PipelineIssue};
