//! Error taxonomy for the agent.
//!
//! Hooks never surface these to instrumented code; recoverable failures drop
//! the sample in hand, unrecoverable ones sticky-disable the session. The
//! variants exist so the session boundary and the image reader have typed
//! results and the logs stay greppable.

use thiserror::Error;

/// Failures the agent can encounter while producing trace data.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// The collector cannot supply or take segments. Sticky-disables.
    #[error("collector session unavailable")]
    SessionUnavailable,

    /// A segment allocation failed and flushing could not free space.
    /// The sample in hand is dropped; the profiler stays enabled.
    #[error("trace segment exhausted")]
    SegmentExhausted,

    /// A freshly exchanged segment cannot hold even a one-record batch.
    /// Fatal configuration error; sticky-disables.
    #[error("segment capacity {0} cannot hold a minimal invocation batch")]
    SegmentTooSmall(usize),

    /// A mapped image could not be inspected; its record is emitted with
    /// zeroed metadata.
    #[error("module image metadata unavailable at {base:#x}: {detail}")]
    ModuleMetadataUnavailable {
        /// Load address of the image.
        base: u64,
        /// What the inspection tripped over.
        detail: &'static str,
    },
}
