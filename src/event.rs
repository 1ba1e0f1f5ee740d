//! SSE event objects and their firmware-visible storage.
//!
//! An [`Event`] is the software-side record of one subscribed event id.
//! Each delivery instance of it owns a [`RegisteredEvent`]: one for a
//! global event, one per possible CPU for a local event. Firmware is handed
//! the physical address of pieces of that storage and the address of the
//! storage itself as the trampoline argument, so a `RegisteredEvent` never
//! moves once built.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::SseConfig;
use crate::error::{Error, SseResult};
use crate::percpu::{CpuId, PerCpu};
use crate::platform::Platform;
use crate::regs::PtRegs;
use crate::sbi::sse_event;

// =============================================================================
// Event Identifiers
// =============================================================================

/// SSE event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u32);

impl EventId {
    /// Global events have exactly one delivery instance platform-wide.
    pub const fn is_global(self) -> bool {
        self.0 & sse_event::GLOBAL_BIT != 0
    }

    /// Raw id as passed in `a0`.
    pub const fn raw(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for EventId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Capability token for code running on the event delivery path.
///
/// Only the dispatch path creates one. Holders run in an NMI-like
/// context: they must not block, take locks or allocate.
pub struct NmiContext<'a> {
    cpu: CpuId,
    _not_send: PhantomData<&'a *mut ()>,
}

impl NmiContext<'_> {
    pub(crate) fn enter(cpu: CpuId) -> Self {
        Self {
            cpu,
            _not_send: PhantomData,
        }
    }

    /// CPU the event is being delivered on.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

/// SSE event handler.
///
/// Runs on the event's private stack with the interrupted context's
/// registers in `regs`. A non-zero return is logged and otherwise ignored.
///
/// Implemented for any `Fn(&NmiContext<'_>, EventId, usize, &mut PtRegs) -> i32`.
pub trait EventHandler: Send + Sync {
    fn handle(&self, nmi: &NmiContext<'_>, event: EventId, arg: usize, regs: &mut PtRegs) -> i32;
}

impl<F> EventHandler for F
where
    F: Fn(&NmiContext<'_>, EventId, usize, &mut PtRegs) -> i32 + Send + Sync,
{
    fn handle(&self, nmi: &NmiContext<'_>, event: EventId, arg: usize, regs: &mut PtRegs) -> i32 {
        self(nmi, event, arg, regs)
    }
}

/// Immutable part of an event, shared with every delivery instance.
pub(crate) struct EventCore {
    pub(crate) id: EventId,
    pub(crate) priority: u32,
    pub(crate) handler: Box<dyn EventHandler>,
    pub(crate) arg: usize,
}

// =============================================================================
// Registered-Event Storage
// =============================================================================

/// Where firmware resumes supervisor code for this instance.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryState {
    pub pc: usize,
    pub arg: usize,
}

/// Registers the trampoline cannot save itself; filled by firmware.
#[repr(C)]
#[derive(Debug, Default)]
pub struct InterruptedState {
    pub a6: AtomicUsize,
    pub a7: AtomicUsize,
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<InterruptedState>(),
    2 * core::mem::size_of::<usize>()
);

#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
struct StackChunk([u8; 16]);

fn alloc_zeroed<T: Clone + Default>(len: usize) -> SseResult<Box<[T]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    buf.resize(len, T::default());
    Ok(buf.into_boxed_slice())
}

/// Box `value`, reporting allocation failure instead of aborting.
pub(crate) fn try_box<T>(value: T) -> SseResult<Box<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(1).map_err(|_| Error::OutOfMemory)?;
    buf.push(value);
    let raw = Box::into_raw(buf.into_boxed_slice()) as *mut T;
    // SAFETY: a one-element slice allocation has the layout of `T`.
    Ok(unsafe { Box::from_raw(raw) })
}

/// Storage for one delivery instance of an event.
#[repr(C)]
pub struct RegisteredEvent {
    entry: EntryState,
    interrupted: InterruptedState,
    attr_buf: AtomicUsize,
    stack: Box<[StackChunk]>,
    shadow_stack: Option<Box<[usize]>>,
    interrupted_phys: usize,
    attr_buf_phys: usize,
    /// Delivery CPU: fixed for local instances, the preferred hart's CPU
    /// for the global instance.
    cpu: AtomicUsize,
    /// Firmware currently holds our entry point for this instance.
    fw_registered: AtomicBool,
    /// Owned by the enclosing [`Event`], which outlives its storage.
    core: NonNull<EventCore>,
}

// SAFETY: `core` points at the owning event's immutable `EventCore`, which
// is itself `Send + Sync`; every other field is.
unsafe impl Send for RegisteredEvent {}
// SAFETY: see above.
unsafe impl Sync for RegisteredEvent {}

impl RegisteredEvent {
    /// Allocate the stacks and build the storage for `cpu`.
    pub(crate) fn new<P: Platform + ?Sized>(
        platform: &P,
        config: &SseConfig,
        cpu: CpuId,
        core: NonNull<EventCore>,
    ) -> SseResult<Box<Self>> {
        let chunks = config.stack_size.div_ceil(core::mem::size_of::<StackChunk>());
        let stack = alloc_zeroed::<StackChunk>(chunks)?;

        let shadow_stack = if config.shadow_call_stack {
            let words = config.shadow_stack_size / core::mem::size_of::<usize>();
            Some(alloc_zeroed::<usize>(words)?)
        } else {
            None
        };

        let mut reg = try_box(Self {
            entry: EntryState::default(),
            interrupted: InterruptedState::default(),
            attr_buf: AtomicUsize::new(0),
            stack,
            shadow_stack,
            interrupted_phys: 0,
            attr_buf_phys: 0,
            cpu: AtomicUsize::new(cpu),
            fw_registered: AtomicBool::new(false),
            core,
        })?;

        let this = &*reg as *const Self as usize;
        reg.entry = EntryState {
            pc: platform.sse_entry_point(),
            arg: this,
        };
        reg.interrupted_phys = platform.virt_to_phys(&reg.interrupted as *const _ as usize);
        reg.attr_buf_phys = platform.virt_to_phys(&reg.attr_buf as *const _ as usize);

        Ok(reg)
    }

    /// Event this instance belongs to.
    pub fn id(&self) -> EventId {
        self.core().id
    }

    /// Entry point and argument handed to firmware at registration.
    pub fn entry(&self) -> EntryState {
        self.entry
    }

    /// Initial stack pointer for the trampoline.
    pub fn stack_top(&self) -> usize {
        self.stack.as_ptr() as usize + self.stack.len() * core::mem::size_of::<StackChunk>()
    }

    /// Initial shadow call stack pointer, when one was allocated.
    pub fn shadow_stack_base(&self) -> Option<usize> {
        self.shadow_stack.as_ref().map(|s| s.as_ptr() as usize)
    }

    /// CPU this instance is delivered on.
    pub fn cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Release);
    }

    /// Check if firmware currently holds this instance's entry point.
    pub fn is_fw_registered(&self) -> bool {
        self.fw_registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_fw_registered(&self, registered: bool) {
        self.fw_registered.store(registered, Ordering::Release);
    }

    pub(crate) fn core(&self) -> &EventCore {
        // SAFETY: the owning event keeps its core alive and never mutates it.
        unsafe { self.core.as_ref() }
    }

    pub(crate) fn interrupted(&self) -> &InterruptedState {
        &self.interrupted
    }

    pub(crate) fn interrupted_phys(&self) -> usize {
        self.interrupted_phys
    }

    /// Scratch word for single-attribute exchange with firmware.
    pub(crate) fn attr_buf(&self) -> &AtomicUsize {
        &self.attr_buf
    }

    pub(crate) fn attr_buf_phys(&self) -> usize {
        self.attr_buf_phys
    }
}

impl core::fmt::Debug for RegisteredEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisteredEvent")
            .field("event", &self.id())
            .field("cpu", &self.cpu())
            .field("entry", &self.entry)
            .field("fw_registered", &self.is_fw_registered())
            .finish()
    }
}

// =============================================================================
// Events
// =============================================================================

/// Global or local representation of an event's storage.
pub(crate) enum EventKind {
    /// Single instance, delivered to its preferred hart.
    Global(Box<RegisteredEvent>),
    /// One instance per possible CPU.
    Local(PerCpu<Box<RegisteredEvent>>),
}

/// A registered SSE event.
pub struct Event {
    pub(crate) kind: EventKind,
    enabled: AtomicBool,
    core: Box<EventCore>,
}

impl Event {
    /// Allocate an event and all of its storage, all or nothing.
    pub(crate) fn alloc<P: Platform + ?Sized>(
        platform: &P,
        config: &SseConfig,
        id: EventId,
        priority: u32,
        handler: Box<dyn EventHandler>,
        arg: usize,
    ) -> SseResult<Arc<Self>> {
        let core = try_box(EventCore {
            id,
            priority,
            handler,
            arg,
        })?;
        let shared = NonNull::from(&*core);

        let kind = if id.is_global() {
            let cpu = platform.current_cpu();
            EventKind::Global(RegisteredEvent::new(platform, config, cpu, shared)?)
        } else {
            EventKind::Local(PerCpu::try_new_with(platform.possible_cpus(), |cpu| {
                RegisteredEvent::new(platform, config, cpu, shared)
            })?)
        };

        // No stable fallible `Arc` constructor; this header is the only
        // allocation here that can still abort.
        Ok(Arc::new(Self {
            kind,
            enabled: AtomicBool::new(false),
            core,
        }))
    }

    /// Event identifier.
    pub fn id(&self) -> EventId {
        self.core.id
    }

    /// Firmware priority written at registration.
    pub fn priority(&self) -> u32 {
        self.core.priority
    }

    /// Check if the event has a single platform-wide instance.
    pub fn is_global(&self) -> bool {
        matches!(self.kind, EventKind::Global(_))
    }

    /// Logical enabled state.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Delivery CPU of a global event.
    pub fn target_cpu(&self) -> Option<CpuId> {
        match &self.kind {
            EventKind::Global(reg) => Some(reg.cpu()),
            EventKind::Local(_) => None,
        }
    }

    /// Storage instance delivered on `cpu`.
    ///
    /// For a global event this is the single instance when `cpu` is its
    /// current target.
    pub fn storage(&self, cpu: CpuId) -> Option<&RegisteredEvent> {
        match &self.kind {
            EventKind::Global(reg) if reg.cpu() == cpu => Some(reg),
            EventKind::Global(_) => None,
            EventKind::Local(regs) => regs.get(cpu).map(|reg| &**reg),
        }
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.core.id)
            .field("priority", &self.core.priority)
            .field("global", &self.is_global())
            .field("enabled", &self.is_enabled())
            .field("target_cpu", &self.target_cpu())
            .finish()
    }
}

/// Client handle returned by registration.
///
/// Consumed by [`crate::Sse::unregister`], which frees all storage.
#[derive(Debug)]
pub struct EventHandle(pub(crate) Arc<Event>);

impl core::ops::Deref for EventHandle {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.0
    }
}
