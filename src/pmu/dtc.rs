//! Per-domain Debug Trace Controller programming: global enable, the
//! periodic snapshot trigger/poll, and reset (§4.5, §4.9).

use std::time::{Duration, Instant};

use crate::error::{CmnError, Result};
use crate::mesh::node::Dtc;
use crate::mmio::MmioWindow;
use crate::register::Register;

use super::RunMode;

const DT_DTC_CTL: u64 = 0x0A00;
const DT_PMCR: u64 = 0x2100;
const DT_TRACE_CONTROL: u64 = 0x0A30;
const DT_PMSRR: u64 = 0x2130;
const DT_PMSSR: u64 = 0x2128;
const DT_PMEVCNTSR: u64 = 0x2050;
const DT_PMOVSR_CLR: u64 = 0x2210;

/// Sets the mode-specific configuration bit before enable: `cntr_rst` in
/// stat mode, `cc_enable` in trace mode.
pub fn configure(dtc: &Dtc, mmio: &MmioWindow, mode: RunMode) -> Result<()> {
    match mode {
        RunMode::Stat => {
            let mut pmcr = Register::new(mmio.read64(dtc.common.reg_base + DT_PMCR)?);
            pmcr.set_bit(5, true);
            mmio.write64(dtc.common.reg_base + DT_PMCR, pmcr.get())
        }
        RunMode::Trace => {
            let mut trace_control = Register::new(mmio.read64(dtc.common.reg_base + DT_TRACE_CONTROL)?);
            trace_control.set_bit(8, true);
            mmio.write64(dtc.common.reg_base + DT_TRACE_CONTROL, trace_control.get())
        }
    }
}

/// Enables domain 0's global PMU/trace gate: `dt_pmcr.pmu_en` in stat
/// mode, always `dt_dtc_ctl.dt_en`.
pub fn enable0(dtc: &Dtc, mmio: &MmioWindow, mode: RunMode) -> Result<()> {
    debug_assert_eq!(dtc.domain, 0, "enable0 is only valid on DTC domain 0");
    if mode == RunMode::Stat {
        let mut pmcr = Register::new(mmio.read64(dtc.common.reg_base + DT_PMCR)?);
        if !pmcr.bit(0) {
            pmcr.set_bit(0, true);
            mmio.write64(dtc.common.reg_base + DT_PMCR, pmcr.get())?;
        }
    }
    let mut ctl = Register::new(mmio.read64(dtc.common.reg_base + DT_DTC_CTL)?);
    if !ctl.bit(0) {
        ctl.set_bit(0, true);
        mmio.write64(dtc.common.reg_base + DT_DTC_CTL, ctl.get())?;
    }
    Ok(())
}

/// Triggers a snapshot on domain 0: writes `dt_pmsrr.ss_req`.
pub fn trigger_snapshot(dtc: &Dtc, mmio: &MmioWindow) -> Result<()> {
    debug_assert_eq!(dtc.domain, 0);
    mmio.write64(dtc.common.reg_base + DT_PMSRR, 1)
}

const SNAPSHOT_TIMEOUT: Duration = Duration::from_millis(100);
const SNAPSHOT_POLL_STEP: Duration = Duration::from_millis(1);

/// Polls `dt_pmssr.ss_status` until bit `dtc_counter_index` is set, then
/// reads the 32-bit DTC shadow slice for that counter.
pub fn read_shadow_counter(dtc: &Dtc, mmio: &MmioWindow, dtc_counter_index: u8) -> Result<u32> {
    let deadline = Instant::now() + SNAPSHOT_TIMEOUT;
    loop {
        let status = Register::new(mmio.read64(dtc.common.reg_base + DT_PMSSR)?);
        if status.bit(dtc_counter_index as u32) {
            break;
        }
        if Instant::now() >= deadline {
            return Err(CmnError::SnapshotTimeout(SNAPSHOT_TIMEOUT));
        }
        std::thread::sleep(SNAPSHOT_POLL_STEP);
    }
    let shadow_reg = DT_PMEVCNTSR + 16 * (dtc_counter_index as u64 / 2);
    let reg = Register::new(mmio.read64(dtc.common.reg_base + shadow_reg)?);
    let start = 32 * (dtc_counter_index as u32 % 2);
    Ok(reg.bits(start, start + 31) as u32)
}

const DTC_RESET_REGS: &[u64] = &[
    DT_DTC_CTL,
    DT_PMCR,
    DT_TRACE_CONTROL,
    0x2000,
    0x2010,
    0x2020,
    0x2030,
    0x2040,
    0x2050,
    0x2060,
    0x2070,
    0x2080,
    0x2090,
];

/// Zeroes every register this module programs and clears the counter
/// overflow status bits.
pub fn reset(dtc: &mut Dtc, mmio: &MmioWindow) -> Result<()> {
    for &reg in DTC_RESET_REGS {
        mmio.write64(dtc.common.reg_base + reg, 0)?;
    }
    mmio.write64(dtc.common.reg_base + DT_PMOVSR_CLR, 0b1_1111_1111)?;
    dtc.active_counters = 0;
    Ok(())
}
