//! SSE event registry and lifecycle.
//!
//! Lock order: `mutex` → `hotplug` (read) → `events`. The hotplug
//! coordinator takes `hotplug` for writing and then `events`, never
//! `mutex`.
//!
//! The set of CPUs events are registered on lives behind `hotplug`. It is
//! seeded from the platform at [`Sse::init`] and changes only in
//! [`Sse::cpu_online`] and [`Sse::cpu_teardown`], so a broadcast never sees
//! a CPU the hotplug coordinator has not handled yet.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::SseConfig;
use crate::error::{Error, SseResult};
use crate::event::{try_box, Event, EventHandle, EventHandler, EventId, EventKind, RegisteredEvent};
use crate::percpu::{CpuId, CpuMask};
use crate::platform::{self, Platform};
use crate::sbi::{eid, sse_attr, sse_fid, SbiError};

/// Supervisor Software Events core.
pub struct Sse<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: SseConfig,
    available: AtomicBool,
    /// Hotplug, PM and reboot hooks are live.
    pub(crate) hooks_installed: AtomicBool,
    /// Serializes registration and enable/disable/retarget sequences.
    pub(crate) mutex: spin::Mutex<()>,
    /// CPUs events are live on. Client operations read, the hotplug
    /// coordinator writes.
    pub(crate) hotplug: spin::RwLock<CpuMask>,
    /// Registered events.
    pub(crate) events: spin::Mutex<Vec<Arc<Event>>>,
}

/// Result of a per-CPU broadcast.
struct Broadcast {
    /// CPUs where the call succeeded.
    done: CpuMask,
    /// First failure, if any.
    error: Option<Error>,
}

impl<P: Platform> Sse<P> {
    /// Create an SSE core. Nothing is available until [`Sse::init`].
    pub const fn new(platform: P, config: SseConfig) -> Self {
        Self {
            platform,
            config,
            available: AtomicBool::new(false),
            hooks_installed: AtomicBool::new(false),
            mutex: spin::Mutex::new(()),
            hotplug: spin::RwLock::new(CpuMask::new()),
            events: spin::Mutex::new(Vec::new()),
        }
    }

    /// Probe the SSE extension and install the transition hooks.
    pub fn init(&self) -> SseResult<()> {
        let cpu = self.platform.current_cpu();
        if !platform::probe_extension(&self.platform, cpu, eid::SSE) {
            log::error!("Missing SBI SSE extension");
            return Err(Error::NotSupported);
        }
        log::info!("SBI SSE extension detected");

        *self.hotplug.write() = self.platform.online_cpus();
        self.hooks_installed.store(true, Ordering::Release);
        self.available.store(true, Ordering::Release);

        log::info!("software events available");
        Ok(())
    }

    /// Check if the SSE extension was found.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Firmware gateway this core was built with.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Configuration this core was built with.
    pub fn config(&self) -> &SseConfig {
        &self.config
    }

    /// CPUs events are currently registered on.
    pub fn online_cpus(&self) -> CpuMask {
        *self.hotplug.read()
    }

    /// Look up a registered event.
    pub fn find(&self, id: EventId) -> Option<Arc<Event>> {
        self.events.lock().iter().find(|e| e.id() == id).cloned()
    }

    /// Ids of all registered events, in registration order.
    pub fn registered_ids(&self) -> Vec<EventId> {
        self.events.lock().iter().map(|e| e.id()).collect()
    }

    // =========================================================================
    // Client API
    // =========================================================================

    /// Register `handler` for event `id`.
    ///
    /// Global events are registered once, targeting the hart firmware
    /// reports as preferred. Local events are registered on every online
    /// CPU; if any CPU fails, the CPUs that succeeded are unregistered and
    /// the error is returned.
    pub fn register<H>(&self, id: EventId, priority: u32, handler: H, arg: usize) -> SseResult<EventHandle>
    where
        H: EventHandler + 'static,
    {
        if !self.is_available() {
            return Err(Error::NotSupported);
        }

        let _guard = self.mutex.lock();
        if self.find(id).is_some() {
            log::error!("Event {} already registered", id);
            return Err(Error::AlreadyExists);
        }

        let cpus = self.hotplug.read();
        let handler: Box<dyn EventHandler> = try_box(handler)?;
        let event = Event::alloc(&self.platform, &self.config, id, priority, handler, arg)?;
        self.events.lock().try_reserve(1).map_err(|_| Error::OutOfMemory)?;

        match &event.kind {
            EventKind::Global(reg) => self.register_global(&cpus, &event, reg)?,
            EventKind::Local(_) => {
                let res = self.broadcast(&cpus, &event, sse_fid::EVENT_REGISTER, true);
                if let Some(err) = res.error {
                    self.broadcast_on(&event, sse_fid::EVENT_UNREGISTER, res.done);
                    return Err(err);
                }
            }
        }

        // Capacity was reserved above and only `mutex` holders push.
        self.events.lock().push(event.clone());
        Ok(EventHandle(event))
    }

    /// Unregister an event and free all of its storage.
    ///
    /// Firmware failures are logged; the event is removed regardless.
    pub fn unregister(&self, handle: EventHandle) {
        let _guard = self.mutex.lock();
        let cpus = self.hotplug.read();
        let event = handle.0;

        self.unregister_nolock(&cpus, &event);
        self.events.lock().retain(|e| !Arc::ptr_eq(e, &event));
    }

    /// Enable delivery.
    ///
    /// For a local event, a failure on any CPU disables the CPUs already
    /// enabled and leaves the event logically disabled.
    pub fn enable(&self, event: &EventHandle) -> SseResult<()> {
        let _guard = self.mutex.lock();
        let cpus = self.hotplug.read();

        match &event.kind {
            EventKind::Global(reg) => {
                self.sbi_event_func(reg.cpu(), event.id(), sse_fid::EVENT_ENABLE)?;
            }
            EventKind::Local(_) => {
                let res = self.broadcast(&cpus, event, sse_fid::EVENT_ENABLE, true);
                if let Some(err) = res.error {
                    self.broadcast_on(event, sse_fid::EVENT_DISABLE, res.done);
                    return Err(err);
                }
            }
        }

        event.set_enabled(true);
        Ok(())
    }

    /// Disable delivery. Best effort: firmware failures are only logged.
    pub fn disable(&self, event: &EventHandle) {
        let _guard = self.mutex.lock();
        let cpus = self.hotplug.read();

        self.disable_nolock(&cpus, event);
        event.set_enabled(false);
    }

    /// Move a global event to `cpu`.
    pub fn set_target_cpu(&self, event: &EventHandle, cpu: CpuId) -> SseResult<()> {
        let _guard = self.mutex.lock();
        let cpus = self.hotplug.read();

        let reg = match &event.kind {
            EventKind::Global(reg) => reg,
            EventKind::Local(_) => return Err(Error::InvalidParameter),
        };
        if !cpus.contains(cpu) {
            return Err(Error::InvalidParameter);
        }

        self.set_target_cpu_nolock(event, reg, cpu)
    }

    // =========================================================================
    // Firmware Helpers
    // =========================================================================

    fn sse_call(&self, cpu: CpuId, fid: usize, args: [usize; 6]) -> Result<usize, SbiError> {
        self.platform.ecall(cpu, eid::SSE, fid, args).into_result()
    }

    pub(crate) fn sbi_event_func(&self, cpu: CpuId, id: EventId, fid: usize) -> SseResult<()> {
        self.sse_call(cpu, fid, [id.raw(), 0, 0, 0, 0, 0])?;
        Ok(())
    }

    pub(crate) fn attr_read(&self, cpu: CpuId, reg: &RegisteredEvent, attr: usize) -> SseResult<usize> {
        self.sse_call(
            cpu,
            sse_fid::EVENT_ATTR_READ,
            [reg.id().raw(), attr, 1, reg.attr_buf_phys(), 0, 0],
        )?;
        Ok(reg.attr_buf().load(Ordering::Acquire))
    }

    fn attr_write(&self, cpu: CpuId, reg: &RegisteredEvent, attr: usize, val: usize) -> Result<(), SbiError> {
        reg.attr_buf().store(val, Ordering::Release);
        self.sse_call(
            cpu,
            sse_fid::EVENT_ATTR_WRITE,
            [reg.id().raw(), attr, 1, reg.attr_buf_phys(), 0, 0],
        )?;
        Ok(())
    }

    /// Write the priority, then hand firmware the entry point of `reg`.
    pub(crate) fn register_on(&self, cpu: CpuId, event: &Event, reg: &RegisteredEvent) -> SseResult<()> {
        self.attr_write(cpu, reg, sse_attr::PRIO, event.priority() as usize)?;

        let entry = reg.entry();
        if let Err(err) = self.sse_call(
            cpu,
            sse_fid::EVENT_REGISTER,
            [event.id().raw(), entry.pc, entry.arg, 0, 0, 0],
        ) {
            log::error!("Failed to register event {} on CPU {}: {}", event.id(), cpu, err);
            return Err(err.into());
        }

        reg.set_fw_registered(true);
        Ok(())
    }

    /// Register a global event from the current CPU, targeting the hart
    /// firmware reports as preferred.
    ///
    /// A preferred hart that maps to no online CPU is replaced by the
    /// registering CPU's hart.
    fn register_global(&self, cpus: &CpuMask, event: &Event, reg: &RegisteredEvent) -> SseResult<()> {
        let cpu = self.platform.current_cpu();
        let hart = self.attr_read(cpu, reg, sse_attr::PREFERRED_HART)?;

        match self.platform.hartid_to_cpu(hart) {
            Some(target) if cpus.contains(target) => {
                reg.set_cpu(target);
                return self.register_on(cpu, event, reg);
            }
            _ => {}
        }

        log::warn!("Event {}: preferred hart {} is offline, using CPU {}", event.id(), hart, cpu);
        reg.set_cpu(cpu);
        self.register_on(cpu, event, reg)?;

        let own = self.platform.cpu_to_hartid(cpu);
        if let Err(err) = self.attr_write(cpu, reg, sse_attr::PREFERRED_HART, own) {
            log::error!("Event {}: failed to retarget to CPU {}: {}", event.id(), cpu, err);
            if let Err(err) = self.sbi_event_func(cpu, event.id(), sse_fid::EVENT_UNREGISTER) {
                log::warn!("Failed to unregister event {}: {}", event.id(), err);
            }
            reg.set_fw_registered(false);
            return Err(err.into());
        }
        Ok(())
    }

    /// Run `fid` for a local event on one CPU.
    pub(crate) fn per_cpu_func(&self, event: &Event, cpu: CpuId, fid: usize) -> SseResult<()> {
        let reg = event.storage(cpu).ok_or(Error::InvalidParameter)?;

        match fid {
            sse_fid::EVENT_REGISTER => self.register_on(cpu, event, reg),
            sse_fid::EVENT_UNREGISTER => {
                let res = self.sbi_event_func(cpu, event.id(), fid);
                reg.set_fw_registered(false);
                res
            }
            _ => self.sbi_event_func(cpu, event.id(), fid),
        }
    }

    /// Run `fid` on every CPU in `cpus` in ascending order.
    ///
    /// With `stop_on_error` the walk ends at the first failure and later
    /// CPUs are never called.
    fn broadcast(&self, cpus: &CpuMask, event: &Event, fid: usize, stop_on_error: bool) -> Broadcast {
        let mut res = Broadcast {
            done: CpuMask::new(),
            error: None,
        };

        for cpu in cpus.iter() {
            match self.per_cpu_func(event, cpu, fid) {
                Ok(()) => res.done.set(cpu),
                Err(err) => {
                    if res.error.is_none() {
                        res.error = Some(err);
                    }
                    if stop_on_error {
                        break;
                    }
                    log::warn!("Event {}: call {} failed on CPU {}: {}", event.id(), fid, cpu, err);
                }
            }
        }

        res
    }

    /// Best-effort `fid` on the CPUs in `cpus`.
    fn broadcast_on(&self, event: &Event, fid: usize, cpus: CpuMask) {
        for cpu in cpus.iter() {
            if let Err(err) = self.per_cpu_func(event, cpu, fid) {
                log::warn!("Event {}: rollback call {} failed on CPU {}: {}", event.id(), fid, cpu, err);
            }
        }
    }

    pub(crate) fn disable_nolock(&self, cpus: &CpuMask, event: &Event) {
        match &event.kind {
            EventKind::Global(reg) => {
                if let Err(err) = self.sbi_event_func(reg.cpu(), event.id(), sse_fid::EVENT_DISABLE) {
                    log::warn!("Failed to disable event {}: {}", event.id(), err);
                }
            }
            EventKind::Local(_) => {
                self.broadcast(cpus, event, sse_fid::EVENT_DISABLE, false);
            }
        }
    }

    pub(crate) fn unregister_nolock(&self, cpus: &CpuMask, event: &Event) {
        match &event.kind {
            EventKind::Global(reg) => {
                if let Err(err) = self.sbi_event_func(reg.cpu(), event.id(), sse_fid::EVENT_UNREGISTER) {
                    log::warn!("Failed to unregister event {}: {}", event.id(), err);
                }
                reg.set_fw_registered(false);
            }
            EventKind::Local(_) => {
                self.broadcast(cpus, event, sse_fid::EVENT_UNREGISTER, false);
            }
        }
    }

    /// Disable, rewrite the preferred hart, re-enable.
    ///
    /// The attribute write is retried without backoff while firmware
    /// reports the event busy, up to `preferred_hart_retry_limit` if set.
    pub(crate) fn set_target_cpu_nolock(&self, event: &Event, reg: &RegisteredEvent, cpu: CpuId) -> SseResult<()> {
        let hart = self.platform.cpu_to_hartid(cpu);
        let old_cpu = reg.cpu();
        let was_enabled = event.is_enabled();

        if was_enabled {
            if let Err(err) = self.sbi_event_func(old_cpu, event.id(), sse_fid::EVENT_DISABLE) {
                log::warn!("Failed to disable event {} before retarget: {}", event.id(), err);
            }
        }

        let mut retries = 0u32;
        let res = loop {
            match self.attr_write(old_cpu, reg, sse_attr::PREFERRED_HART, hart) {
                Err(SbiError::InvalidState) => {
                    if let Some(limit) = self.config.preferred_hart_retry_limit {
                        retries += 1;
                        if retries >= limit {
                            break Err(Error::Timeout);
                        }
                    }
                    core::hint::spin_loop();
                }
                other => break other.map_err(Error::from),
            }
        };

        if res.is_ok() {
            reg.set_cpu(cpu);
        }

        if was_enabled {
            if let Err(err) = self.sbi_event_func(reg.cpu(), event.id(), sse_fid::EVENT_ENABLE) {
                log::warn!("Failed to re-enable event {} on CPU {}: {}", event.id(), reg.cpu(), err);
            }
        }

        res
    }
}

impl<P: Platform + core::fmt::Debug> core::fmt::Debug for Sse<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sse")
            .field("platform", &self.platform)
            .field("available", &self.is_available())
            .field("events", &self.registered_ids())
            .finish()
    }
}
