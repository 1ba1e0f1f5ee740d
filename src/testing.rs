//! Scripted firmware used by the unit tests.
//!
//! `FakePlatform` records every SBI call, models the SSE and DBTR state a
//! real SBI implementation keeps, and fails calls on demand.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::event::EventId;
use crate::percpu::{CpuId, CpuMask};
use crate::platform::Platform;
use crate::sbi::{base_fid, dbtr_fid, eid, sse_attr, sse_fid, SbiError, SbiRet};

/// One recorded SBI call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub cpu: CpuId,
    pub eid: usize,
    pub fid: usize,
    pub args: [usize; 6],
}

/// Firmware view of one SSE event instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FwEvent {
    pub registered: bool,
    pub enabled: bool,
    pub prio: usize,
}

/// Firmware view of one installed trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwTrigger {
    pub tdata1: usize,
    pub tdata2: usize,
    pub tdata3: usize,
    pub enabled: bool,
}

/// Make matching calls fail.
#[derive(Debug, Clone, Copy)]
pub struct Fault {
    eid: usize,
    fid: usize,
    error: SbiError,
    cpu: Option<CpuId>,
    arg1: Option<usize>,
    remaining: Option<u32>,
}

impl Fault {
    pub fn new(eid: usize, fid: usize, error: SbiError) -> Self {
        Self {
            eid,
            fid,
            error,
            cpu: None,
            arg1: None,
            remaining: None,
        }
    }

    pub fn on_cpu(mut self, cpu: CpuId) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_arg1(mut self, arg1: usize) -> Self {
        self.arg1 = Some(arg1);
        self
    }

    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, call: &Call) -> bool {
        self.eid == call.eid
            && self.fid == call.fid
            && self.cpu.map_or(true, |cpu| cpu == call.cpu)
            && self.arg1.map_or(true, |arg| arg == call.args[1])
    }
}

#[derive(Default)]
struct State {
    possible: usize,
    online: CpuMask,
    current: CpuId,
    sse_present: bool,
    calls: Vec<Call>,
    faults: Vec<Fault>,
    local: BTreeMap<(CpuId, u32), FwEvent>,
    global: BTreeMap<u32, FwEvent>,
    preferred: BTreeMap<u32, usize>,
    interrupted: BTreeMap<(CpuId, u32), (usize, usize)>,
    masked: CpuMask,
    soft_irqs: Vec<CpuId>,

    dbtr_present: bool,
    mcontrol6: usize,
    mcontrol: usize,
    shmem: BTreeMap<CpuId, usize>,
    triggers: BTreeMap<(CpuId, usize), FwTrigger>,
    forced_index: Option<usize>,
}

/// In-memory SBI firmware with SSE and DBTR state and a call log.
pub struct FakePlatform {
    state: spin::Mutex<State>,
}

/// # Safety
/// `phys` must be the address of a live, aligned `usize` (virt and phys
/// are identical here).
unsafe fn word<'a>(phys: usize) -> &'a AtomicUsize {
    unsafe { &*(phys as *const AtomicUsize) }
}

impl FakePlatform {
    pub const ENTRY_POINT: usize = 0xffff_ffff_8000_4000;

    /// `cpus` possible CPUs, all online, SSE present, no DBTR.
    pub fn new(cpus: usize) -> Self {
        Self {
            state: spin::Mutex::new(State {
                possible: cpus,
                online: CpuMask::first(cpus),
                sse_present: true,
                ..State::default()
            }),
        }
    }

    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.state.lock().current = cpu;
    }

    pub fn set_online(&self, cpus: &[CpuId]) {
        self.state.lock().online = cpus.iter().copied().collect();
    }

    pub fn set_sse_present(&self, present: bool) {
        self.state.lock().sse_present = present;
    }

    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, eid: usize, fid: usize) -> usize {
        let state = self.state.lock();
        state.calls.iter().filter(|c| c.eid == eid && c.fid == fid).count()
    }

    pub fn count_on(&self, cpu: CpuId, eid: usize, fid: usize) -> usize {
        let state = self.state.lock();
        state
            .calls
            .iter()
            .filter(|c| c.cpu == cpu && c.eid == eid && c.fid == fid)
            .count()
    }

    pub fn local(&self, cpu: CpuId, id: EventId) -> FwEvent {
        self.state.lock().local.get(&(cpu, id.0)).copied().unwrap_or_default()
    }

    pub fn global(&self, id: EventId) -> FwEvent {
        self.state.lock().global.get(&id.0).copied().unwrap_or_default()
    }

    pub fn set_preferred_hart(&self, id: EventId, hart: usize) {
        self.state.lock().preferred.insert(id.0, hart);
    }

    pub fn preferred_hart(&self, id: EventId) -> usize {
        self.state.lock().preferred.get(&id.0).copied().unwrap_or(0)
    }

    pub fn set_interrupted(&self, cpu: CpuId, id: EventId, a6: usize, a7: usize) {
        self.state.lock().interrupted.insert((cpu, id.0), (a6, a7));
    }

    pub fn soft_irqs(&self) -> Vec<CpuId> {
        self.state.lock().soft_irqs.clone()
    }

    pub fn is_masked(&self, cpu: CpuId) -> bool {
        self.state.lock().masked.contains(cpu)
    }

    /// Enable DBTR with the given trigger counts per format.
    pub fn set_triggers(&self, mcontrol6: usize, mcontrol: usize) {
        let mut state = self.state.lock();
        state.dbtr_present = true;
        state.mcontrol6 = mcontrol6;
        state.mcontrol = mcontrol;
    }

    pub fn shmem(&self, cpu: CpuId) -> Option<usize> {
        self.state.lock().shmem.get(&cpu).copied()
    }

    pub fn trigger(&self, cpu: CpuId, idx: usize) -> Option<FwTrigger> {
        self.state.lock().triggers.get(&(cpu, idx)).copied()
    }

    /// Place the next installed trigger at `idx`, whether or not it is free.
    pub fn force_install_index(&self, idx: usize) {
        self.state.lock().forced_index = Some(idx);
    }

    fn take_fault(state: &mut State, call: &Call) -> Option<SbiError> {
        let pos = state.faults.iter().position(|f| f.matches(call))?;
        let fault = &mut state.faults[pos];
        let error = fault.error;
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
            if *n == 0 {
                state.faults.remove(pos);
            }
        }
        Some(error)
    }

    fn instance(state: &mut State, cpu: CpuId, id: u32) -> &mut FwEvent {
        if EventId(id).is_global() {
            state.global.entry(id).or_default()
        } else {
            state.local.entry((cpu, id)).or_default()
        }
    }

    /// Word `idx` of `cpu`'s registered trigger shared memory.
    fn shmem_word(state: &State, cpu: CpuId, idx: usize) -> Result<&'static AtomicUsize, SbiError> {
        let base = state.shmem.get(&cpu).copied().ok_or(SbiError::NoShmem)?;
        // SAFETY: the registered shared memory holds at least one entry.
        Ok(unsafe { word(base + idx * core::mem::size_of::<usize>()) })
    }

    fn sse_call(state: &mut State, call: &Call) -> Result<usize, SbiError> {
        let [evt, attr, count, phys, ..] = call.args;
        let id = evt as u32;
        let cpu = call.cpu;

        match call.fid {
            sse_fid::EVENT_ATTR_READ => {
                let values: Vec<usize> = (attr..attr + count)
                    .map(|a| match a {
                        sse_attr::PREFERRED_HART => state.preferred.get(&id).copied().unwrap_or(0),
                        sse_attr::INTERRUPTED_A6 => state.interrupted.get(&(cpu, id)).map_or(0, |v| v.0),
                        sse_attr::INTERRUPTED_A7 => state.interrupted.get(&(cpu, id)).map_or(0, |v| v.1),
                        _ => 0,
                    })
                    .collect();
                for (i, value) in values.into_iter().enumerate() {
                    // SAFETY: the caller passed a buffer of `count` words.
                    unsafe { word(phys + i * core::mem::size_of::<usize>()) }.store(value, Ordering::SeqCst);
                }
            }
            sse_fid::EVENT_ATTR_WRITE => {
                // SAFETY: the caller passed a buffer of `count` words.
                let value = unsafe { word(phys) }.load(Ordering::SeqCst);
                match attr {
                    sse_attr::PRIO => Self::instance(state, cpu, id).prio = value,
                    sse_attr::PREFERRED_HART => {
                        state.preferred.insert(id, value);
                    }
                    _ => {}
                }
            }
            sse_fid::EVENT_REGISTER => Self::instance(state, cpu, id).registered = true,
            sse_fid::EVENT_UNREGISTER => *Self::instance(state, cpu, id) = FwEvent::default(),
            sse_fid::EVENT_ENABLE => Self::instance(state, cpu, id).enabled = true,
            sse_fid::EVENT_DISABLE => Self::instance(state, cpu, id).enabled = false,
            sse_fid::HART_MASK => state.masked.set(cpu),
            sse_fid::HART_UNMASK => state.masked.clear(cpu),
            _ => return Err(SbiError::NotSupported),
        }
        Ok(0)
    }

    fn read_tdata(state: &State, cpu: CpuId) -> Result<[usize; 3], SbiError> {
        let mut tdata = [0; 3];
        for (i, value) in tdata.iter_mut().enumerate() {
            *value = usize::from_le(Self::shmem_word(state, cpu, i + 1)?.load(Ordering::SeqCst));
        }
        Ok(tdata)
    }

    fn dbtr_call(state: &mut State, call: &Call) -> Result<usize, SbiError> {
        if !state.dbtr_present {
            return Err(SbiError::NotSupported);
        }
        let cpu = call.cpu;
        let [a0, a1, ..] = call.args;
        let total = state.mcontrol6.max(state.mcontrol);
        match call.fid {
            dbtr_fid::NUM_TRIGGERS => {
                let count = match a0 >> 60 {
                    0 => total,
                    6 => state.mcontrol6,
                    2 => state.mcontrol,
                    _ => 0,
                };
                return Ok(count);
            }
            dbtr_fid::SETUP_SHMEM => {
                if a0 == usize::MAX && a1 == usize::MAX {
                    state.shmem.remove(&cpu);
                } else {
                    state.shmem.insert(cpu, a0);
                }
            }
            dbtr_fid::TRIG_INSTALL => {
                let [tdata1, tdata2, tdata3] = Self::read_tdata(state, cpu)?;
                let trigger = FwTrigger {
                    tdata1,
                    tdata2,
                    tdata3,
                    enabled: true,
                };
                let idx = match state.forced_index.take() {
                    Some(idx) => {
                        state.triggers.insert((cpu, idx), trigger);
                        idx
                    }
                    None => {
                        let free = (0..total).find(|&i| !state.triggers.contains_key(&(cpu, i)));
                        match free {
                            Some(idx) => {
                                state.triggers.insert((cpu, idx), trigger);
                                idx
                            }
                            None => total,
                        }
                    }
                };
                Self::shmem_word(state, cpu, 0)?.store(idx.to_le(), Ordering::SeqCst);
            }
            dbtr_fid::TRIG_UPDATE => {
                let [tdata1, tdata2, tdata3] = Self::read_tdata(state, cpu)?;
                let trigger = state.triggers.get_mut(&(cpu, a0)).ok_or(SbiError::InvalidParam)?;
                trigger.tdata1 = tdata1;
                trigger.tdata2 = tdata2;
                trigger.tdata3 = tdata3;
            }
            dbtr_fid::TRIG_UNINSTALL => {
                state.triggers.remove(&(cpu, a0)).ok_or(SbiError::InvalidParam)?;
            }
            dbtr_fid::TRIG_ENABLE | dbtr_fid::TRIG_DISABLE => {
                let trigger = state.triggers.get_mut(&(cpu, a0)).ok_or(SbiError::InvalidParam)?;
                trigger.enabled = call.fid == dbtr_fid::TRIG_ENABLE;
            }
            _ => return Err(SbiError::NotSupported),
        }
        Ok(0)
    }
}

impl Platform for FakePlatform {
    fn ecall(&self, cpu: CpuId, ext: usize, fid: usize, args: [usize; 6]) -> SbiRet {
        let call = Call {
            cpu,
            eid: ext,
            fid,
            args,
        };
        let mut state = self.state.lock();
        state.calls.push(call);

        if let Some(error) = Self::take_fault(&mut state, &call) {
            return SbiRet::failure(error);
        }

        let res = match ext {
            eid::BASE if fid == base_fid::PROBE_EXTENSION => Ok(match args[0] {
                eid::SSE => state.sse_present as usize,
                eid::DBTR => state.dbtr_present as usize,
                _ => 0,
            }),
            eid::SSE if state.sse_present => Self::sse_call(&mut state, &call),
            eid::DBTR => Self::dbtr_call(&mut state, &call),
            _ => Err(SbiError::NotSupported),
        };

        match res {
            Ok(value) => SbiRet::success(value),
            Err(error) => SbiRet::failure(error),
        }
    }

    fn possible_cpus(&self) -> usize {
        self.state.lock().possible
    }

    fn online_cpus(&self) -> CpuMask {
        self.state.lock().online
    }

    fn current_cpu(&self) -> CpuId {
        self.state.lock().current
    }

    fn sse_entry_point(&self) -> usize {
        Self::ENTRY_POINT
    }

    fn raise_soft_interrupt(&self, cpu: CpuId) {
        self.state.lock().soft_irqs.push(cpu);
    }
}
