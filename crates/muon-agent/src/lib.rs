//! In-process invocation profiler.
//!
//! Instrumented function prologues divert into this crate's entry thunks;
//! the entry hook mirrors the frame on a per-thread shadow stack and
//! rewrites the return address so the epilogue diverts into the exit hook,
//! which attributes the elapsed cycles to the (caller, callee) pair. Pairs
//! are coalesced into running statistics packed into fixed-size trace
//! segments, and full segments are exchanged with a collector through the
//! [`session::SessionClient`] transport boundary.
//!
//! The shadow stack tolerates exceptions and other non-local exits by
//! position: frames whose stack slots are below the current stack are
//! orphans and get trimmed on the next hook. All hot-path state is
//! thread-local; the only process-wide pieces are the [`profiler::Profiler`]
//! singleton and its session.
//!
//! The host loads the agent, installs a transport with
//! [`profiler::Profiler::init`] before the first instrumented call, and
//! tears down with [`profiler::Profiler::shutdown`]. Cycle accounting is
//! TSC-based and per-thread; see [`cycles`] for the counter contract.

pub mod cycles;
pub mod error;
pub mod frame;
pub mod image;
pub mod profiler;
pub mod segment;
pub mod session;
pub mod shadow;
#[cfg(target_arch = "x86_64")]
pub mod thunks;

pub use cycles::{CycleSource, ManualCycles};
#[cfg(target_arch = "x86_64")]
pub use cycles::Tsc;
pub use error::ProfileError;
pub use frame::EntryFrame;
pub use profiler::{Profiler, ThreadState};
pub use segment::{DEFAULT_SEGMENT_CAPACITY, TraceSegment};
pub use session::{MemoryClient, MemoryCollector, NullClient, Session, SessionClient};
pub use shadow::{ShadowFrame, ShadowStack};
