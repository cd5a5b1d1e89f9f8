//! Segment exchange with the collector.
//!
//! [`SessionClient`] is the transport boundary: it hands out the first empty
//! segment and swaps full segments for fresh ones. [`Session`] wraps a
//! client with the sticky disabled flag every hook consults lock-free, and
//! with the process-wide sequence numbering the collector uses to order a
//! thread's segments. The mutex below is only ever taken around
//! create/exchange, never on the cycle-measured path.
//!
//! [`MemoryClient`] is an in-process sink for harnesses; [`NullClient`]
//! backs a profiler that was never given a transport and fails straight
//! into the disabled state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::ProfileError;
use crate::segment::TraceSegment;

/// Obtains empty segments from, and returns filled segments to, a
/// collector.
///
/// Implementations consume `segment.used_bytes()` before returning; the
/// caller resets the segment for reuse afterwards. Any error is terminal
/// for the session.
pub trait SessionClient: Send {
    /// Establishes the session and hands back the first empty segment.
    fn create_session(&mut self, segment: &mut TraceSegment) -> Result<(), ProfileError>;

    /// Submits the current (possibly full) segment and receives a fresh
    /// empty one.
    fn exchange(&mut self, segment: &mut TraceSegment) -> Result<(), ProfileError>;
}

struct SessionInner {
    client: Box<dyn SessionClient>,
    started: bool,
    next_sequence: u64,
}

/// A [`SessionClient`] plus the sticky disabled state and segment
/// sequencing.
pub struct Session {
    inner: Mutex<SessionInner>,
    disabled: AtomicBool,
}

impl Session {
    /// A session over `client`, enabled until the first failure.
    pub fn new(client: Box<dyn SessionClient>) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                client,
                started: false,
                next_sequence: 0,
            }),
            disabled: AtomicBool::new(false),
        }
    }

    /// Sticky; once true every hook short-circuits to a no-op.
    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Enters the terminal disabled state.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    /// Trades `segment` for a fresh empty one, creating the session on the
    /// first call. Returns false on any failure, after which the session is
    /// disabled for good.
    pub fn exchange(&self, segment: &mut TraceSegment) -> bool {
        if self.is_disabled() {
            return false;
        }

        let Ok(mut inner) = self.inner.lock() else {
            self.disable();
            return false;
        };

        let result = if inner.started {
            inner.client.exchange(segment)
        } else {
            inner.started = true;
            inner.client.create_session(segment)
        };

        match result {
            Ok(()) => {
                let sequence = inner.next_sequence;
                inner.next_sequence += 1;
                segment.reset(sequence);
                true
            }
            Err(err) => {
                drop(inner);
                log::error!("trace session lost: {err}");
                self.disable();
                false
            }
        }
    }
}

/// In-process accumulation of filled segment images, oldest first.
#[derive(Default)]
pub struct MemoryCollector {
    segments: Mutex<Vec<Vec<u8>>>,
}

impl MemoryCollector {
    /// A fresh, empty collector behind an [`Arc`] for sharing with clients.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copies of every received segment image, in arrival order.
    pub fn segments(&self) -> Vec<Vec<u8>> {
        self.segments.lock().expect("collector poisoned").clone()
    }

    /// Number of segments received so far.
    pub fn segment_count(&self) -> usize {
        self.segments.lock().expect("collector poisoned").len()
    }

    fn receive(&self, image: Vec<u8>) {
        self.segments.lock().expect("collector poisoned").push(image);
    }
}

/// A [`SessionClient`] that copies filled segments into a
/// [`MemoryCollector`]. Header-only segments are not recorded.
pub struct MemoryClient {
    collector: Arc<MemoryCollector>,
}

impl MemoryClient {
    /// A client feeding `collector`.
    pub fn new(collector: Arc<MemoryCollector>) -> Self {
        Self { collector }
    }
}

impl SessionClient for MemoryClient {
    fn create_session(&mut self, _segment: &mut TraceSegment) -> Result<(), ProfileError> {
        Ok(())
    }

    fn exchange(&mut self, segment: &mut TraceSegment) -> Result<(), ProfileError> {
        if segment.has_payload() {
            self.collector.receive(segment.used_bytes().to_vec());
        }
        Ok(())
    }
}

/// The client used when no transport was configured: every operation fails,
/// so the profiler disables itself on first contact.
#[derive(Default)]
pub struct NullClient;

impl SessionClient for NullClient {
    fn create_session(&mut self, _segment: &mut TraceSegment) -> Result<(), ProfileError> {
        Err(ProfileError::SessionUnavailable)
    }

    fn exchange(&mut self, _segment: &mut TraceSegment) -> Result<(), ProfileError> {
        Err(ProfileError::SessionUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use muon_wire::KIND_INVOCATION_BATCH;

    use super::*;

    #[test]
    fn exchange_stamps_increasing_sequence_numbers() {
        let collector = MemoryCollector::new();
        let session = Session::new(Box::new(MemoryClient::new(collector.clone())));
        let mut segment = TraceSegment::new(256, 1);

        assert!(session.exchange(&mut segment)); // create
        assert_eq!(segment.header().sequence_number, 0);

        segment.place_record(KIND_INVOCATION_BATCH, 48).unwrap();
        assert!(session.exchange(&mut segment));
        assert_eq!(segment.header().sequence_number, 1);
        assert!(!segment.has_payload());

        assert_eq!(collector.segment_count(), 1);
    }

    #[test]
    fn header_only_segments_are_not_collected() {
        let collector = MemoryCollector::new();
        let session = Session::new(Box::new(MemoryClient::new(collector.clone())));
        let mut segment = TraceSegment::new(256, 1);

        assert!(session.exchange(&mut segment));
        assert!(session.exchange(&mut segment));
        assert_eq!(collector.segment_count(), 0);
    }

    #[test]
    fn failure_disables_the_session_for_good() {
        let session = Session::new(Box::new(NullClient));
        let mut segment = TraceSegment::new(256, 1);

        assert!(!session.is_disabled());
        assert!(!session.exchange(&mut segment));
        assert!(session.is_disabled());

        // Sticky: nothing re-enables it.
        assert!(!session.exchange(&mut segment));
        assert!(session.is_disabled());
    }
}
