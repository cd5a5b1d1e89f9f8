//! Per-thread profiling state and the process-wide singleton.
//!
//! Every mutable piece of profiler state -- shadow stack, invocation table,
//! module ledger, active segment, overhead accumulator -- lives in a
//! [`ThreadState`] reached through a thread-local slot, so the hooks take no
//! locks on the measured path. The [`Profiler`] singleton only carries the
//! shared [`Session`]; it is constructed idempotently from whichever thread
//! hooks first, and the thunk entry points at the bottom of this module are
//! the only way in from instrumented code.
//!
//! The hooks keep a running tally of cycles spent inside the profiler and
//! subtract it from measured durations, so reported costs approximate user
//! code alone.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Once, OnceLock};

use muon_wire::{
    INVOCATION_RECORD_SIZE, InvocationRecord, KIND_INVOCATION_BATCH, MODULE_RECORD_SIZE,
    ModuleRecord, PREFIX_SIZE, REASON_PROCESS_DETACH, REASON_THREAD_DETACH, attach_kind,
};

use crate::cycles::CycleSource;
use crate::error::ProfileError;
use crate::frame::EntryFrame;
use crate::image;
use crate::segment::{DEFAULT_SEGMENT_CAPACITY, TraceSegment};
use crate::session::{NullClient, Session, SessionClient};
use crate::shadow::{ShadowFrame, ShadowStack};

static UNKNOWN_REASON_LOGGED: Once = Once::new();

/// All profiling state owned by one thread.
///
/// Generic over the cycle source so harnesses can drive the overhead
/// accounting deterministically; production threads use the TSC.
pub struct ThreadState<C: CycleSource> {
    session: Arc<Session>,
    cycles: C,
    /// Address entry hooks write into displaced return-address slots.
    exit_hook: u64,
    /// Cycles spent inside the profiler so far, subtracted from
    /// measurements. Monotone within the thread.
    cycles_overhead: u64,
    stack: ShadowStack,
    /// (caller, callee) to the record's byte offset in the active segment.
    /// Emptied on every exchange; the offsets die with the segment.
    invocations: HashMap<(u64, u64), usize>,
    segment: TraceSegment,
    /// Prefix offset of the still-growing invocation batch, if any.
    open_batch: Option<usize>,
    /// Module bases this thread has already described in the trace.
    logged_modules: HashSet<u64>,
}

impl<C: CycleSource> ThreadState<C> {
    /// Creates the state and obtains this thread's first segment from the
    /// session. If the session cannot supply one it flips to disabled and
    /// every hook on this state short-circuits.
    pub fn new(session: Arc<Session>, cycles: C, exit_hook: u64, segment_capacity: usize) -> Self {
        let mut segment = TraceSegment::new(segment_capacity, current_thread_id());
        session.exchange(&mut segment);
        Self {
            session,
            cycles,
            exit_hook,
            cycles_overhead: 0,
            stack: ShadowStack::new(),
            invocations: HashMap::new(),
            segment,
            open_batch: None,
            logged_modules: HashSet::new(),
        }
    }

    /// Current shadow-stack depth.
    pub fn shadow_depth(&self) -> usize {
        self.stack.depth()
    }

    /// Cycles attributed to the profiler itself so far on this thread.
    pub fn overhead_cycles(&self) -> u64 {
        self.cycles_overhead
    }

    /// Observes an instrumented function entry: mirrors the frame, then
    /// diverts the callee's return into the exit hook.
    pub fn on_function_entry(&mut self, frame: &mut EntryFrame, callee: u64, cycles_now: u64) {
        if self.session.is_disabled() {
            return;
        }

        self.stack.trim_on_entry(frame.frame_pointer());

        let displaced = frame.return_address();
        // A tail-called function sees the exit hook as its caller because
        // the tail caller's slot was already rewritten; attribute it to the
        // call site still mirrored on top instead.
        let caller = if displaced == self.exit_hook {
            self.stack.top().map_or(displaced, |top| top.caller)
        } else {
            displaced
        };

        self.stack.push(ShadowFrame {
            caller,
            callee,
            entry_cycles: cycles_now.saturating_sub(self.cycles_overhead),
            real_return_address: displaced,
            frame_pointer: frame.frame_pointer(),
        });

        frame.set_return_address(self.exit_hook);
        self.update_overhead(cycles_now);
    }

    /// Observes an instrumented function exit and returns the displaced
    /// real return address. `slot_address` is the stack address of the
    /// return-address slot the `ret` just vacated.
    ///
    /// Aborts the process when no frame matches: the entry hook pushes
    /// before it displaces a return address, so an empty mirror here means
    /// the instrumented image and the profiler have diverged beyond repair.
    pub fn on_function_exit(&mut self, slot_address: usize, cycles_now: u64) -> u64 {
        self.stack.trim_on_exit(slot_address);
        let Some(frame) = self.stack.pop() else {
            log::error!("exit hook ran with an empty shadow stack");
            std::process::abort();
        };

        let duration = cycles_now
            .saturating_sub(frame.entry_cycles)
            .saturating_sub(self.cycles_overhead);
        self.record_invocation(frame.caller, frame.callee, duration);

        self.update_overhead(cycles_now);
        frame.real_return_address
    }

    /// Observes entry into a module-lifecycle function (a `DllMain`-shaped
    /// callee): arg 0 is the module base, arg 1 the reason code. Attach
    /// reasons describe the module in the trace once per (thread, module);
    /// detach reasons are observed silently. Falls through to
    /// [`Self::on_function_entry`] for the same frame either way.
    pub fn on_module_entry(&mut self, frame: &mut EntryFrame, callee: u64, cycles_now: u64) {
        if self.session.is_disabled() {
            return;
        }

        let module = frame.arg(0);
        let reason = frame.arg(1) as u32;

        match attach_kind(reason) {
            Some(kind) => {
                if self.logged_modules.insert(module) {
                    self.emit_module_record(module, reason, kind);
                }
            }
            None => match reason {
                REASON_PROCESS_DETACH | REASON_THREAD_DETACH => {}
                _ => UNKNOWN_REASON_LOGGED
                    .call_once(|| log::warn!("unrecognized module event reason {reason}")),
            },
        }

        self.on_function_entry(frame, callee, cycles_now);
    }

    fn emit_module_record(&mut self, module: u64, reason: u32, kind: u16) {
        if !self.segment.can_allocate(MODULE_RECORD_SIZE) && !self.flush() {
            return;
        }
        let Some(offset) = self.segment.place_record(kind, MODULE_RECORD_SIZE) else {
            log::warn!(
                "dropping module record for {module:#x}: {}",
                ProfileError::SegmentExhausted
            );
            return;
        };

        // SAFETY: the module-entry hook delivers the base of an image the
        // loader has mapped and is currently running initializers for.
        let record = match unsafe { image::inspect_module(module) } {
            Ok(info) => {
                let mut record = ModuleRecord::zeroed(module, reason);
                record.image_size = info.image_size;
                record.checksum = info.checksum;
                record.time_date_stamp = info.time_date_stamp;
                record.set_name(&info.name);
                record
            }
            Err(err) => {
                log::warn!("{err}");
                ModuleRecord::zeroed(module, reason)
            }
        };
        *self.segment.record_mut::<ModuleRecord>(offset) = record;

        // Ship the definition now so it reaches the collector before any
        // invocation record that resolves against this module, including
        // ones other threads are about to emit.
        self.flush();
    }

    fn record_invocation(&mut self, caller: u64, callee: u64, duration_cycles: u64) {
        let key = (caller, callee);
        if let Some(&offset) = self.invocations.get(&key) {
            let info = self.segment.record_mut::<InvocationRecord>(offset);
            info.num_calls = info.num_calls.saturating_add(1);
            info.cycles_sum += duration_cycles;
            if duration_cycles < info.cycles_min {
                info.cycles_min = duration_cycles;
            } else if duration_cycles > info.cycles_max {
                info.cycles_max = duration_cycles;
            }
        } else if let Some(offset) = self.allocate_invocation_slot() {
            *self.segment.record_mut::<InvocationRecord>(offset) = InvocationRecord {
                caller,
                callee,
                num_calls: 1,
                reserved: 0,
                cycles_sum: duration_cycles,
                cycles_min: duration_cycles,
                cycles_max: duration_cycles,
            };
            self.invocations.insert(key, offset);
        }
        // Allocation failure drops this sample; the next one retries.
    }

    /// Finds space for one more [`InvocationRecord`]: grow the open batch,
    /// else start a new batch, else flush and start one in the fresh
    /// segment.
    fn allocate_invocation_slot(&mut self) -> Option<usize> {
        if let Some(batch_prefix) = self.open_batch {
            if let Some(tail) = self.segment.extend_record(batch_prefix, INVOCATION_RECORD_SIZE) {
                return Some(tail);
            }
        }

        if !self.segment.can_allocate(INVOCATION_RECORD_SIZE) && !self.flush() {
            return None;
        }

        match self.segment.place_record(KIND_INVOCATION_BATCH, INVOCATION_RECORD_SIZE) {
            Some(offset) => {
                self.open_batch = Some(offset - PREFIX_SIZE);
                Some(offset)
            }
            None => {
                // Even an empty segment cannot hold a one-record batch.
                log::error!("{}", ProfileError::SegmentTooSmall(self.segment.capacity()));
                self.session.disable();
                None
            }
        }
    }

    /// Trades the active segment for a fresh one. The open batch and the
    /// invocation table point into the outgoing segment, so both are
    /// dropped first.
    fn flush(&mut self) -> bool {
        self.open_batch = None;
        self.invocations.clear();
        self.session.exchange(&mut self.segment)
    }

    fn update_overhead(&mut self, hook_entry_cycles: u64) {
        self.cycles_overhead += self.cycles.read().saturating_sub(hook_entry_cycles);
    }
}

impl<C: CycleSource> Drop for ThreadState<C> {
    /// Best-effort final flush on thread detach.
    fn drop(&mut self) {
        if self.segment.has_payload() {
            self.flush();
        }
    }
}

/// The process-wide profiler: the shared session plus the thread-local
/// store that lazily produces a [`ThreadState`] per thread.
pub struct Profiler {
    session: Arc<Session>,
}

static INSTANCE: OnceLock<Profiler> = OnceLock::new();

impl Profiler {
    /// Installs the transport and constructs the singleton. Idempotent:
    /// after the first call (or the first hook, whichever comes first) the
    /// existing instance wins and a later `client` is dropped unused.
    pub fn init(client: Box<dyn SessionClient>) -> &'static Profiler {
        INSTANCE.get_or_init(move || Profiler {
            session: Arc::new(Session::new(client)),
        })
    }

    /// The singleton, constructing it without a transport if [`Self::init`]
    /// never ran; in that case the session disables itself on first use and
    /// every hook is a no-op.
    pub fn instance() -> &'static Profiler {
        INSTANCE.get_or_init(|| Profiler {
            session: Arc::new(Session::new(Box::new(NullClient))),
        })
    }

    /// The shared session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Flushes and releases the calling thread's state, as on thread
    /// detach. The next hook on this thread starts fresh.
    pub fn detach_current_thread() {
        let _ = THREAD_STATE.try_with(|slot| slot.borrow_mut().take());
    }

    /// Process teardown: releases the calling thread's state and disables
    /// the session so every other thread's hooks become no-ops.
    pub fn shutdown(&self) {
        Self::detach_current_thread();
        self.session.disable();
    }
}

#[cfg(target_arch = "x86_64")]
type ProductionState = ThreadState<crate::cycles::Tsc>;

thread_local! {
    #[cfg(target_arch = "x86_64")]
    static THREAD_STATE: RefCell<Option<Box<ProductionState>>> = const { RefCell::new(None) };

    /// Reentrancy guard: true while a hook is live on this thread.
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

#[cfg(not(target_arch = "x86_64"))]
thread_local! {
    static THREAD_STATE: RefCell<Option<()>> = const { RefCell::new(None) };
}

/// Snapshots the thread's errno and restores it on drop, so hook work never
/// perturbs the instrumented program's observable error state.
struct ErrnoKeeper {
    #[cfg(target_os = "linux")]
    saved: i32,
}

impl ErrnoKeeper {
    fn capture() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            // SAFETY: __errno_location returns this thread's errno slot.
            saved: unsafe { *libc::__errno_location() },
        }
    }
}

impl Drop for ErrnoKeeper {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        // SAFETY: as in capture; the slot outlives the hook.
        unsafe {
            *libc::__errno_location() = self.saved;
        }
    }
}

/// Claims the in-hook flag, or `None` when a hook is already live here.
struct HookGuard;

impl HookGuard {
    fn enter() -> Option<HookGuard> {
        IN_HOOK
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(HookGuard)
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u32 {
    // SAFETY: gettid has no preconditions and cannot fail.
    (unsafe { libc::gettid() }) as u32
}

#[cfg(not(target_os = "linux"))]
fn current_thread_id() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static ID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

#[cfg(target_arch = "x86_64")]
fn with_thread_state<R>(f: impl FnOnce(&mut ProductionState) -> R) -> Option<R> {
    THREAD_STATE
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            let state = slot.get_or_insert_with(|| {
                let profiler = Profiler::instance();
                Box::new(ThreadState::new(
                    profiler.session.clone(),
                    crate::cycles::Tsc,
                    crate::thunks::exit_thunk_address(),
                    DEFAULT_SEGMENT_CAPACITY,
                ))
            });
            f(state)
        })
        .ok()
}

#[cfg(target_arch = "x86_64")]
fn with_existing_thread_state<R>(f: impl FnOnce(&mut ProductionState) -> R) -> Option<R> {
    THREAD_STATE
        .try_with(|slot| slot.borrow_mut().as_mut().map(|state| f(state)))
        .ok()
        .flatten()
}

/// High-level target of the function-entry thunk.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe extern "C" fn function_entry_hook(
    frame: *mut EntryFrame,
    callee: u64,
    cycles: u64,
) {
    let _errno = ErrnoKeeper::capture();
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    with_thread_state(|state| {
        // SAFETY: the thunk built `frame` over its live register save area.
        state.on_function_entry(unsafe { &mut *frame }, callee, cycles)
    });
}

/// High-level target of the module-entry thunk.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe extern "C" fn module_entry_hook(
    frame: *mut EntryFrame,
    callee: u64,
    cycles: u64,
) {
    let _errno = ErrnoKeeper::capture();
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    with_thread_state(|state| {
        // SAFETY: as in `function_entry_hook`.
        state.on_module_entry(unsafe { &mut *frame }, callee, cycles)
    });
}

/// High-level target of the exit thunk. Always returns the real return
/// address; an exit with no thread state means an entry was observed and
/// the state has since been destroyed, which is unrecoverable.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe extern "C" fn function_exit_hook(slot_address: usize, cycles: u64) -> u64 {
    let _errno = ErrnoKeeper::capture();
    let _guard = HookGuard::enter();
    match with_existing_thread_state(|state| state.on_function_exit(slot_address, cycles)) {
        Some(real_return_address) => real_return_address,
        None => {
            log::error!("exit hook ran without thread state");
            std::process::abort();
        }
    }
}
