//! Detection engine module for Norx
//!
//! The compiled ruleset ([`DetectionContext`]), the per-worker scratch bound to
//! it ([`WorkerContext`]), and the keyword and matcher plumbing both depend on.

pub mod context;
pub mod keyword;
pub mod mpm;
pub mod signature;
pub mod thread_ctx;

use crate::config::ConfigError;
use std::collections::TryReserveError;
use thiserror::Error;

pub use context::DetectionContext;
pub use keyword::{KeywordFns, KeywordRegistration, KeywordThreadCtx, ThreadKeyword};
pub use signature::Signature;
pub use thread_ctx::WorkerContext;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Memory allocation failed: {0}")]
    Allocation(#[from] TryReserveError),

    #[error("Failed to build pattern matcher: {0}")]
    Matcher(#[from] aho_corasick::BuildError),

    #[error("Keyword \"{name}\" failed to set up its thread context")]
    KeywordInit { name: String },

    #[error("Invalid keyword registration: {0}")]
    KeywordRegistration(String),

    #[error("No detection context has been published")]
    NoContext,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DetectError {
    /// Configuration errors stop the process. Everything else fails only the
    /// construction that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectError::Config(_))
    }
}
