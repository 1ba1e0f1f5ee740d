//! CPU hotplug, power-transition and reboot coordination.
//!
//! The embedding kernel calls these from its hotplug state machine, its CPU
//! PM notifier chain and its reboot/kexec path. [`Sse::cpu_online`] and
//! [`Sse::cpu_teardown`] are the only writers of the CPU set client
//! broadcasts walk, and update it under the hotplug write lock together
//! with the per-CPU registrations.

use core::sync::atomic::Ordering;

use crate::event::EventKind;
use crate::percpu::CpuId;
use crate::platform::Platform;
use crate::sbi::{eid, sse_fid};
use crate::sse::Sse;

/// CPU power-management transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmEvent {
    /// The CPU is about to enter a low-power state.
    Enter,
    /// Entry into the low-power state failed.
    EnterFailed,
    /// The CPU left the low-power state.
    Exit,
}

impl<P: Platform> Sse<P> {
    fn hooks_live(&self) -> bool {
        self.is_available() && self.hooks_installed.load(Ordering::Acquire)
    }

    fn hart_mask_func(&self, cpu: CpuId, fid: usize) {
        let ret = self.platform.ecall(cpu, eid::SSE, fid, [0; 6]);
        if let Err(err) = ret.into_result() {
            log::warn!("CPU {}: hart mask call {} failed: {}", cpu, fid, err);
        }
    }

    /// Stop event delivery on `cpu`.
    pub fn mask_cpu(&self, cpu: CpuId) {
        self.hart_mask_func(cpu, sse_fid::HART_MASK);
    }

    /// Resume event delivery on `cpu`.
    pub fn unmask_cpu(&self, cpu: CpuId) {
        self.hart_mask_func(cpu, sse_fid::HART_UNMASK);
    }

    /// `cpu` came online: restore local events there and unmask it.
    ///
    /// Client broadcasts reach `cpu` only after this returns. Events are not
    /// restored on a CPU that is already tracked as online.
    pub fn cpu_online(&self, cpu: CpuId) {
        if !self.hooks_live() {
            return;
        }

        let mut cpus = self.hotplug.write();
        if !cpus.contains(cpu) {
            cpus.set(cpu);
            self.restore_local_events(cpu);
        }
        drop(cpus);

        self.unmask_cpu(cpu);
    }

    /// Register local events on `cpu`, enabling those logically enabled.
    fn restore_local_events(&self, cpu: CpuId) {
        let events = self.events.lock();

        for event in events.iter().filter(|e| !e.is_global()) {
            if let Err(err) = self.per_cpu_func(event, cpu, sse_fid::EVENT_REGISTER) {
                log::warn!("CPU {}: failed to restore event {}: {}", cpu, event.id(), err);
                continue;
            }
            if event.is_enabled() {
                if let Err(err) = self.per_cpu_func(event, cpu, sse_fid::EVENT_ENABLE) {
                    log::warn!("CPU {}: failed to enable event {}: {}", cpu, event.id(), err);
                }
            }
        }
    }

    /// `cpu` is going offline: mask it, drop its local registrations and
    /// move global events that target it elsewhere.
    pub fn cpu_teardown(&self, cpu: CpuId) {
        if !self.hooks_live() {
            return;
        }

        self.mask_cpu(cpu);

        let mut cpus = self.hotplug.write();
        cpus.clear(cpu);
        let events = self.events.lock();

        for event in events.iter() {
            match &event.kind {
                EventKind::Local(_) => {
                    if event.is_enabled() {
                        if let Err(err) = self.per_cpu_func(event, cpu, sse_fid::EVENT_DISABLE) {
                            log::warn!("CPU {}: failed to disable event {}: {}", cpu, event.id(), err);
                        }
                    }
                    if let Err(err) = self.per_cpu_func(event, cpu, sse_fid::EVENT_UNREGISTER) {
                        log::warn!("CPU {}: failed to unregister event {}: {}", cpu, event.id(), err);
                    }
                }
                EventKind::Global(reg) if reg.cpu() == cpu => {
                    let Some(target) = cpus.any_but(cpu) else {
                        log::warn!("CPU {}: no CPU left to take event {}", cpu, event.id());
                        continue;
                    };
                    if let Err(err) = self.set_target_cpu_nolock(event, reg, target) {
                        log::warn!("Failed to move event {} off CPU {}: {}", event.id(), cpu, err);
                    }
                }
                EventKind::Global(_) => {}
            }
        }
    }

    /// Per-CPU power transition: only masks or unmasks delivery.
    pub fn pm_notify(&self, cpu: CpuId, pm: PmEvent) {
        if !self.hooks_live() {
            return;
        }

        match pm {
            PmEvent::Enter => self.mask_cpu(cpu),
            PmEvent::EnterFailed | PmEvent::Exit => self.unmask_cpu(cpu),
        }
    }

    /// Reboot, panic or kexec: leave firmware with no delivery targets.
    ///
    /// Every event is disabled and unregistered whatever its recorded
    /// state. Errors are ignored. The hotplug and PM hooks are inert
    /// afterwards.
    pub fn reboot(&self) {
        self.hooks_installed.store(false, Ordering::Release);

        let _guard = self.mutex.lock();
        let cpus = self.hotplug.read();
        let events = self.events.lock();

        for event in events.iter() {
            self.disable_nolock(&cpus, event);
            event.set_enabled(false);
            self.unregister_nolock(&cpus, event);
        }
    }
}
