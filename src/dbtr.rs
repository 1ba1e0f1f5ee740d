//! Hardware breakpoints and watchpoints through the SBI debug triggers
//! extension.
//!
//! Firmware owns the trigger table; each CPU exchanges trigger data with it
//! through a small shared-memory area. The per-CPU slot table remembers
//! which breakpoint object sits at each firmware-assigned index so a trap
//! can be routed back to it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::breakpoint::{self, BreakpointConfig, BreakpointKind, BreakpointRequest, TriggerFormat};
use crate::config::{DbtrConfig, HW_BP_NUM_MAX};
use crate::error::{Error, SseResult};
use crate::percpu::{CpuId, PerCpu};
use crate::platform::{self, IrqGuard, Platform};
use crate::regs::PtRegs;
use crate::sbi::{dbtr_fid, eid, SbiError};

// =============================================================================
// Shared Memory
// =============================================================================

/// One shared-memory entry.
///
/// Supervisor writes `tstate, tdata1, tdata2, tdata3`; after an install
/// firmware writes the assigned trigger index over word 0.
#[repr(C)]
#[derive(Debug, Default)]
pub struct DbtrShmemEntry {
    words: [AtomicUsize; 4],
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<DbtrShmemEntry>(),
    4 * core::mem::size_of::<usize>()
);

impl DbtrShmemEntry {
    const IDX: usize = 0;
    const TDATA1: usize = 1;
    const TDATA2: usize = 2;
    const TDATA3: usize = 3;

    fn write_trigger(&self, config: &BreakpointConfig) {
        self.words[Self::TDATA1].store(config.tdata1.to_le(), Ordering::Relaxed);
        self.words[Self::TDATA2].store(config.tdata2.to_le(), Ordering::Relaxed);
        self.words[Self::TDATA3].store(config.tdata3.to_le(), Ordering::Release);
    }

    fn read_idx(&self) -> usize {
        usize::from_le(self.words[Self::IDX].load(Ordering::Acquire))
    }
}

// =============================================================================
// Breakpoints
// =============================================================================

/// Receives trigger hits; the performance-monitoring side of a breakpoint.
pub trait BreakpointHandler: Send + Sync {
    fn hit(&self, config: &BreakpointConfig, regs: &mut PtRegs);
}

impl<F> BreakpointHandler for F
where
    F: Fn(&BreakpointConfig, &mut PtRegs) + Send + Sync,
{
    fn hit(&self, config: &BreakpointConfig, regs: &mut PtRegs) {
        self(config, regs)
    }
}

/// A breakpoint object as installed into a slot.
///
/// Slots are matched by object identity, not by configuration.
pub struct HwBreakpoint {
    config: spin::RwLock<BreakpointConfig>,
    handler: Box<dyn BreakpointHandler>,
}

impl HwBreakpoint {
    pub fn new<H>(config: BreakpointConfig, handler: H) -> Arc<Self>
    where
        H: BreakpointHandler + 'static,
    {
        Arc::new(Self {
            config: spin::RwLock::new(config),
            handler: Box::new(handler),
        })
    }

    pub fn config(&self) -> BreakpointConfig {
        *self.config.read()
    }

    /// Replace the trigger configuration; push it with
    /// [`TriggerManager::update`] if installed.
    pub fn reconfigure(&self, config: BreakpointConfig) {
        *self.config.write() = config;
    }
}

impl core::fmt::Debug for HwBreakpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HwBreakpoint").field("config", &self.config()).finish()
    }
}

/// Outcome of trap processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapNotify {
    /// No installed trigger matched.
    Done,
    /// At least one trigger matched and was serviced.
    Stop,
}

// =============================================================================
// Trigger Manager
// =============================================================================

/// Result of trigger capability discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerCaps {
    pub format: Option<TriggerFormat>,
    pub count: usize,
}

impl TriggerCaps {
    const NONE: Self = Self {
        format: None,
        count: 0,
    };
}

type SlotTable = [Option<Arc<HwBreakpoint>>; HW_BP_NUM_MAX];

struct CpuTriggers {
    /// Serializes use of `shmem` and the slot table; taken with IRQs off.
    slots: spin::Mutex<SlotTable>,
    shmem: spin::Once<Box<[DbtrShmemEntry]>>,
}

/// Hardware trigger manager.
pub struct TriggerManager<P: Platform> {
    platform: P,
    config: DbtrConfig,
    caps: spin::Once<TriggerCaps>,
    cpus: PerCpu<CpuTriggers>,
}

impl<P: Platform> TriggerManager<P> {
    /// Create the manager with empty per-CPU state for every possible CPU.
    pub fn new(platform: P, config: DbtrConfig) -> SseResult<Self> {
        let cpus = PerCpu::try_new_with(platform.possible_cpus(), |_| {
            Ok(CpuTriggers {
                slots: spin::Mutex::new(core::array::from_fn(|_| None)),
                shmem: spin::Once::new(),
            })
        })?;

        Ok(Self {
            platform,
            config,
            caps: spin::Once::new(),
            cpus,
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Discovered capabilities; discovery runs once, on first use.
    pub fn caps(&self) -> TriggerCaps {
        *self.caps.call_once(|| self.discover())
    }

    /// Number of usable trigger slots per CPU.
    pub fn slot_count(&self) -> usize {
        self.caps().count
    }

    fn dbtr_call(&self, cpu: CpuId, fid: usize, args: [usize; 6]) -> Result<usize, SbiError> {
        self.platform.ecall(cpu, eid::DBTR, fid, args).into_result()
    }

    fn discover(&self) -> TriggerCaps {
        let cpu = self.platform.current_cpu();

        if !platform::probe_extension(&self.platform, cpu, eid::DBTR) {
            log::warn!("SBI DBTR extension is not supported");
            return TriggerCaps::NONE;
        }

        if self.dbtr_call(cpu, dbtr_fid::NUM_TRIGGERS, [0; 6]).is_err() {
            log::warn!("Failed to detect triggers");
            return TriggerCaps::NONE;
        }

        // Prefer mcontrol6; fall back to legacy mcontrol
        for format in [TriggerFormat::Mcontrol6, TriggerFormat::Mcontrol] {
            let tdata1 = format.tdata1_type();
            match self.dbtr_call(cpu, dbtr_fid::NUM_TRIGGERS, [tdata1, 0, 0, 0, 0, 0]) {
                Err(err) => log::warn!("Failed to detect type {} triggers: {}", format.type_code(), err),
                Ok(0) => log::warn!("Type {} triggers not available", format.type_code()),
                Ok(n) => {
                    let count = n.min(self.config.max_triggers).min(HW_BP_NUM_MAX);
                    log::info!("Total number of type {} triggers: {}", format.type_code(), count);
                    return TriggerCaps {
                        format: Some(format),
                        count,
                    };
                }
            }
        }

        TriggerCaps::NONE
    }

    /// Encode a request in the discovered trigger format.
    pub fn parse(&self, req: &BreakpointRequest) -> SseResult<BreakpointConfig> {
        match self.caps().format {
            Some(format) => breakpoint::parse(format, req),
            None => {
                log::warn!("Unsupported trigger type");
                Err(Error::NotSupported)
            }
        }
    }

    /// Check if a breakpoint covers only kernel addresses.
    pub fn check_in_kernelspace(&self, config: &BreakpointConfig) -> bool {
        config.in_kernelspace(self.config.task_size)
    }

    /// Allocate shared memory for every possible CPU and register it on
    /// the online ones.
    ///
    /// With no triggers this does nothing. If registration fails on any
    /// online CPU, the CPUs already set up are torn down again.
    pub fn init(&self) -> SseResult<()> {
        let count = self.slot_count();
        if count == 0 {
            log::info!("No hardware triggers available");
            return Ok(());
        }

        for (_, cpu) in self.cpus.iter() {
            let mut shmem = Vec::new();
            shmem.try_reserve_exact(count).map_err(|_| {
                log::warn!("Failed to allocate shared memory");
                Error::OutOfMemory
            })?;
            shmem.resize_with(count, DbtrShmemEntry::default);
            cpu.shmem.call_once(|| shmem.into_boxed_slice());
        }

        let online = self.platform.online_cpus();
        let mut done = Vec::new();
        for cpu in online.iter() {
            if let Err(err) = self.cpu_online(cpu) {
                for &cpu in &done {
                    self.cpu_offline(cpu);
                }
                return Err(err);
            }
            done.push(cpu);
        }

        Ok(())
    }

    fn shmem(&self, cpu: CpuId) -> Option<&[DbtrShmemEntry]> {
        self.cpus.get(cpu)?.shmem.get().map(|s| &**s)
    }

    /// Register `cpu`'s shared memory with firmware.
    pub fn cpu_online(&self, cpu: CpuId) -> SseResult<()> {
        let Some(shmem) = self.shmem(cpu) else {
            log::error!("Invalid per-cpu shared memory for debug triggers");
            return Err(Error::NotSupported);
        };

        let pa = self.platform.virt_to_phys(shmem.as_ptr() as usize);
        let res = self.dbtr_call(cpu, dbtr_fid::SETUP_SHMEM, [pa, 0, 0, 0, 0, 0]);
        if let Err(err) = res {
            return Err(match err {
                SbiError::Denied => {
                    log::warn!("Access denied for shared memory at {:#x}", pa);
                    Error::PermissionDenied
                }
                SbiError::InvalidParam | SbiError::InvalidAddress => {
                    log::warn!("Invalid address parameter ({})", err);
                    Error::InvalidParameter
                }
                SbiError::AlreadyAvailable => {
                    log::warn!("Shared memory is already set");
                    Error::AlreadyInUse
                }
                SbiError::Failed => {
                    log::error!("Internal sdtrig state error");
                    Error::Firmware
                }
                _ => {
                    log::warn!("Unknown error {}", err);
                    Error::Firmware
                }
            });
        }

        log::info!("CPU {}: HW breakpoint shared memory registered", cpu);
        Ok(())
    }

    /// Withdraw `cpu`'s shared memory from firmware. Failures are logged.
    pub fn cpu_offline(&self, cpu: CpuId) {
        let res = self.dbtr_call(cpu, dbtr_fid::SETUP_SHMEM, [usize::MAX, usize::MAX, 0, 0, 0, 0]);
        if let Err(err) = res {
            log::error!("CPU {}: failed to disable shared memory: {}", cpu, err);
        }
        log::info!("CPU {}: HW breakpoint shared memory disabled", cpu);
    }

    /// Install `bp` on `cpu`, returning the firmware-assigned slot.
    pub fn install(&self, cpu: CpuId, bp: &Arc<HwBreakpoint>) -> SseResult<usize> {
        let count = self.slot_count();
        if count == 0 {
            return Err(Error::NotSupported);
        }
        let state = self.cpus.get(cpu).ok_or(Error::InvalidParameter)?;
        let shmem = self.shmem(cpu).ok_or(Error::from(SbiError::NoShmem))?;

        let _irq = IrqGuard::new(&self.platform);
        let mut slots = state.slots.lock();

        let config = bp.config();
        shmem[0].write_trigger(&config);

        if let Err(err) = self.dbtr_call(cpu, dbtr_fid::TRIG_INSTALL, [1, 0, 0, 0, 0, 0]) {
            log::warn!("Failed to install trigger: {}", err);
            return Err(err.into());
        }

        let idx = shmem[0].read_idx();
        if idx >= count {
            log::warn!("Invalid trigger index {}", idx);
            self.discard(cpu, idx);
            return Err(Error::InvalidParameter);
        }
        if slots[idx].is_some() {
            log::warn!("Slot {} is in use", idx);
            self.discard(cpu, idx);
            return Err(Error::Busy);
        }

        log::debug!("Trigger {:#x} installed at index {}", config.tdata2, idx);
        slots[idx] = Some(bp.clone());
        Ok(idx)
    }

    /// Drop a trigger firmware installed at an index we cannot track.
    fn discard(&self, cpu: CpuId, idx: usize) {
        if let Err(err) = self.dbtr_call(cpu, dbtr_fid::TRIG_UNINSTALL, [idx, 1, 0, 0, 0, 0]) {
            log::warn!("Failed to release untracked trigger {}: {}", idx, err);
        }
    }

    fn find_slot(slots: &SlotTable, count: usize, bp: &Arc<HwBreakpoint>) -> Option<usize> {
        slots[..count]
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, bp)))
    }

    /// Run `fid` on the slot holding `bp`, optionally vacating it first.
    fn slot_call(&self, cpu: CpuId, bp: &Arc<HwBreakpoint>, fid: usize, vacate: bool, what: &str) -> Option<usize> {
        let state = self.cpus.get(cpu)?;
        let count = self.slot_count();

        let _irq = IrqGuard::new(&self.platform);
        let mut slots = state.slots.lock();

        let Some(idx) = Self::find_slot(&slots, count, bp) else {
            log::warn!("{}: breakpoint not installed", what);
            return None;
        };
        if vacate {
            slots[idx] = None;
        }

        if fid == dbtr_fid::TRIG_UPDATE {
            match self.shmem(cpu) {
                Some(shmem) => shmem[0].write_trigger(&bp.config()),
                None => return Some(idx),
            }
        }

        if let Err(err) = self.dbtr_call(cpu, fid, [idx, 1, 0, 0, 0, 0]) {
            log::warn!("{}: failed on trigger {}: {}", what, idx, err);
        }
        Some(idx)
    }

    /// Remove `bp` from `cpu`. Returns the freed slot, `None` if `bp` was
    /// not installed.
    pub fn uninstall(&self, cpu: CpuId, bp: &Arc<HwBreakpoint>) -> Option<usize> {
        self.slot_call(cpu, bp, dbtr_fid::TRIG_UNINSTALL, true, "uninstall")
    }

    /// Re-arm an installed `bp` on `cpu`. Returns its slot, `None` if `bp`
    /// was not installed.
    pub fn enable(&self, cpu: CpuId, bp: &Arc<HwBreakpoint>) -> Option<usize> {
        self.slot_call(cpu, bp, dbtr_fid::TRIG_ENABLE, false, "enable")
    }

    /// Disarm an installed `bp` on `cpu` without freeing its slot.
    pub fn disable(&self, cpu: CpuId, bp: &Arc<HwBreakpoint>) -> Option<usize> {
        self.slot_call(cpu, bp, dbtr_fid::TRIG_DISABLE, false, "disable")
    }

    /// Push the current configuration of an installed `bp` to firmware.
    pub fn update(&self, cpu: CpuId, bp: &Arc<HwBreakpoint>) -> Option<usize> {
        self.slot_call(cpu, bp, dbtr_fid::TRIG_UPDATE, false, "update")
    }

    /// Occupant of `idx` on `cpu`.
    pub fn slot(&self, cpu: CpuId, idx: usize) -> Option<Arc<HwBreakpoint>> {
        let state = self.cpus.get(cpu)?;
        let slots = state.slots.lock();
        slots.get(idx)?.clone()
    }

    /// Debug trap on `cpu`: service every installed trigger whose address
    /// matches the trap.
    ///
    /// Handlers run after the slot lock is dropped.
    pub fn handle_trap(&self, cpu: CpuId, regs: &mut PtRegs) -> TrapNotify {
        let Some(state) = self.cpus.get(cpu) else {
            return TrapNotify::Done;
        };
        let count = self.slot_count();

        let mut hits: SlotTable = core::array::from_fn(|_| None);
        {
            // The slot lock is held with IRQs off; a trap taken inside it
            // cannot be ours to service.
            let Some(slots) = state.slots.try_lock() else {
                return TrapNotify::Done;
            };
            for (hit, slot) in hits.iter_mut().zip(slots[..count].iter()) {
                if let Some(bp) = slot {
                    let config = bp.config();
                    let addr = match config.kind {
                        BreakpointKind::Breakpoint => regs.epc,
                        BreakpointKind::Watchpoint => regs.badaddr,
                    };
                    if config.address == addr {
                        *hit = Some(bp.clone());
                    }
                }
            }
        }

        let mut ret = TrapNotify::Done;
        for bp in hits.iter().flatten() {
            bp.handler.hit(&bp.config(), regs);
            ret = TrapNotify::Stop;
        }
        ret
    }
}
