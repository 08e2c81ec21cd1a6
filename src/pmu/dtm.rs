//! Per-XP Debug Trace Monitor programming: watchpoint allocation and the
//! register sequence described in §4.4.

use crate::error::{CmnError, Result};
use crate::event::{Direction, Event, PmuInfo};
use crate::mesh::node::{Dtc, Xp};
use crate::mmio::MmioWindow;
use crate::register::Register;

use super::RunMode;

const WP_CONFIG: u64 = 0x21A0;
const WP_VAL: u64 = 0x21A8;
const WP_MASK: u64 = 0x21B0;
const STRIDE: u64 = 24;
const DTM_PMU_CONFIG: u64 = 0x2210;
const DTM_CONTROL: u64 = 0x2100;

fn direction_pair(direction: Direction) -> (u8, u8) {
    match direction {
        Direction::Up => (0, 1),
        Direction::Down => (2, 3),
    }
}

/// Allocates watchpoint slots for `event` on `xp`: one slot for a
/// single-group event, both slots of the direction pair (with the primary
/// slot's `wp_combine` bit set) for a two-group event.
fn allocate_slots(xp: &mut Xp, event: &Event) -> Result<Vec<u8>> {
    let (a, b) = direction_pair(event.direction);
    if event.wp_val_masks.len() == 2 {
        if xp.wp_in_use[a as usize] || xp.wp_in_use[b as usize] {
            return Err(CmnError::NoResources("watchpoint pair"));
        }
        xp.wp_in_use[a as usize] = true;
        xp.wp_in_use[b as usize] = true;
        Ok(vec![a, b])
    } else {
        for slot in [a, b] {
            if !xp.wp_in_use[slot as usize] {
                xp.wp_in_use[slot as usize] = true;
                return Ok(vec![slot]);
            }
        }
        Err(CmnError::NoResources("watchpoint"))
    }
}

/// Programs one XP's watchpoint slots (and, in stat mode, its PMU counter
/// pairing) for `event`, then records the binding in `event.pmu_info`.
pub fn configure(
    xp: &mut Xp,
    mmio: &MmioWindow,
    event: &mut Event,
    mode: RunMode,
    dtc: &mut Dtc,
) -> Result<()> {
    let slots = allocate_slots(xp, event)?;
    let primary = slots[0];
    let combined = slots.len() == 2;

    for (g, &k) in slots.iter().enumerate() {
        let (value, mask) = event.wp_val_masks[g];
        let group_id = event.match_groups[g].group;
        mmio.write64(xp.common.reg_base + WP_VAL + STRIDE * k as u64, value)?;
        mmio.write64(xp.common.reg_base + WP_MASK + STRIDE * k as u64, mask)?;

        let mut cfg = Register::new(mmio.read64(xp.common.reg_base + WP_CONFIG + STRIDE * k as u64)?);
        cfg.set_bits(1, 3, event.chn_sel() as u64);
        cfg.set_bit(0, (event.port & 1) != 0);
        cfg.set_bits(17, 18, (event.port >> 1) as u64);
        cfg.set_bits(4, 5, group_id as u64);
        if combined && k == primary {
            cfg.set_bit(9, true);
        }
        if mode == RunMode::Trace {
            cfg.set_bit(10, true);
            cfg.set_bits(11, 13, 0b100);
            cfg.set_bit(14, true);
        }
        mmio.write64(xp.common.reg_base + WP_CONFIG + STRIDE * k as u64, cfg.get())?;
    }

    let dtc_counter_index: i8 = match mode {
        RunMode::Stat => {
            let counter = dtc.next_counter()?;
            let mut pmu_cfg = Register::new(mmio.read64(xp.common.reg_base + DTM_PMU_CONFIG)?);
            let k = primary as u64;
            pmu_cfg.set_bits(32 + 8 * k, 39 + 8 * k, primary as u64);
            pmu_cfg.set_bit((4 + k) as u32, true);
            pmu_cfg.set_bits(16 + 4 * k, 18 + 4 * k, counter as u64);
            pmu_cfg.set_bit(8, true);
            mmio.write64(xp.common.reg_base + DTM_PMU_CONFIG, pmu_cfg.get())?;
            counter as i8
        }
        RunMode::Trace => {
            let mut ctl = Register::new(mmio.read64(xp.common.reg_base + DTM_CONTROL)?);
            ctl.set_bit(3, true);
            mmio.write64(xp.common.reg_base + DTM_CONTROL, ctl.get())?;
            -1
        }
    };

    event.pmu_info = Some(PmuInfo {
        xp_node_id: xp.common.node_id,
        wp_index: primary,
        dtc_counter_index,
    });
    Ok(())
}

/// Sets `dtm_control.dtm_en`, the last write in an XP's configuration
/// scope; in stat mode, also sets `dtm_pmu_config.pmu_en` first.
pub fn enable(xp: &Xp, mmio: &MmioWindow, mode: RunMode) -> Result<()> {
    if mode == RunMode::Stat {
        let mut pmu_cfg = Register::new(mmio.read64(xp.common.reg_base + DTM_PMU_CONFIG)?);
        if !pmu_cfg.bit(0) {
            pmu_cfg.set_bit(0, true);
            mmio.write64(xp.common.reg_base + DTM_PMU_CONFIG, pmu_cfg.get())?;
        }
    }
    let mut ctl = Register::new(mmio.read64(xp.common.reg_base + DTM_CONTROL)?);
    if !ctl.bit(0) {
        ctl.set_bit(0, true);
        mmio.write64(xp.common.reg_base + DTM_CONTROL, ctl.get())?;
    }
    Ok(())
}

/// Sets `dtm_control.trace_tag_enable`, gating trace-packet emission from
/// every event on the mesh by the first event's match.
pub fn enable_tracetag(xp: &Xp, mmio: &MmioWindow) -> Result<()> {
    let mut ctl = Register::new(mmio.read64(xp.common.reg_base + DTM_CONTROL)?);
    ctl.set_bit(1, true);
    mmio.write64(xp.common.reg_base + DTM_CONTROL, ctl.get())
}

const DTM_PMEVCNTSR: u64 = 0x2240;

/// Reads the 16-bit DTM shadow slice for watchpoint slot `wp_index`.
pub fn read_shadow_counter(xp: &Xp, mmio: &MmioWindow, wp_index: u8) -> Result<u16> {
    let reg = Register::new(mmio.read64(xp.common.reg_base + DTM_PMEVCNTSR)?);
    let lo = 16 * wp_index as u32;
    Ok(reg.bits(lo, lo + 15) as u16)
}

const FIFO_ENTRY_READY: u64 = 0x2118;
const FIFO_ENTRY_0: u64 = 0x2120;
const FIFO_ENTRY_1: u64 = 0x2128;
const FIFO_ENTRY_2: u64 = 0x2130;

/// `true` if the FIFO has a fresh entry queued for watchpoint `wp_index`.
pub fn fifo_entry_ready(xp: &Xp, mmio: &MmioWindow, wp_index: u8) -> Result<bool> {
    let reg = Register::new(mmio.read64(xp.common.reg_base + FIFO_ENTRY_READY)?);
    Ok(reg.bit(wp_index as u32))
}

/// Acknowledges the FIFO entry for `wp_index`, freeing the hardware to
/// advance.
pub fn fifo_ack(xp: &Xp, mmio: &MmioWindow, wp_index: u8) -> Result<()> {
    mmio.write64(xp.common.reg_base + FIFO_ENTRY_READY, 1u64 << wp_index)
}

/// Reads the three 64-bit FIFO words for `wp_index` directly into `dst`
/// (three consecutive `u64`s), avoiding an intermediate allocation.
///
/// # Safety
/// `dst` must be valid for three consecutive `u64` writes.
pub unsafe fn fifo_read_into(xp: &Xp, mmio: &MmioWindow, wp_index: u8, dst: *mut u64) -> Result<()> {
    let base = xp.common.reg_base + STRIDE * wp_index as u64;
    mmio.read64_into(base + FIFO_ENTRY_0, dst)?;
    mmio.read64_into(base + FIFO_ENTRY_1, dst.add(1))?;
    mmio.read64_into(base + FIFO_ENTRY_2, dst.add(2))?;
    Ok(())
}

const XP_RESET_REGS: &[u64] = &[
    DTM_CONTROL,
    DTM_PMU_CONFIG,
    0x2000, // mxp_pmu_event_sel
    WP_CONFIG,
    WP_CONFIG + STRIDE,
    WP_CONFIG + 2 * STRIDE,
    WP_CONFIG + 3 * STRIDE,
    WP_VAL,
    WP_VAL + STRIDE,
    WP_VAL + 2 * STRIDE,
    WP_VAL + 3 * STRIDE,
    WP_MASK,
    WP_MASK + STRIDE,
    WP_MASK + 2 * STRIDE,
    WP_MASK + 3 * STRIDE,
    0x2220, // dtm_pmevcnt
    DTM_PMEVCNTSR,
];

/// Zeroes every register this module programs and drains the FIFO, in the
/// order described in §4.9.
pub fn reset(xp: &mut Xp, mmio: &MmioWindow) -> Result<()> {
    for &reg in XP_RESET_REGS {
        mmio.write64(xp.common.reg_base + reg, 0)?;
    }
    mmio.write64(xp.common.reg_base + FIFO_ENTRY_READY, 0b1111)?;
    xp.wp_in_use = [false; 4];
    Ok(())
}
