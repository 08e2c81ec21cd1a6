//! Walks the on-chip descriptor tree starting at the CFG root and builds a
//! typed [`Mesh`](crate::mesh::Mesh).

use std::collections::HashMap;

use crate::error::{CmnError, Result};
use crate::mmio::MmioWindow;
use crate::register::{ceil_log2, Register};

use super::node::{DeviceNode, Dtc, NodeCommon, NodeKind, PortInfo, Xp};
use super::Mesh;

const CFG_TAG: u16 = 0x0002;
const XP_TAG: u16 = 0x0006;

struct RawChild {
    node_id: u16,
    logical_id: u16,
    reg_base: u64,
    kind: NodeKind,
}

fn read_node_common(mmio: &MmioWindow, reg_base: u64) -> Result<(u16, u16, u32, u32)> {
    let node_info = Register::new(mmio.read64(reg_base)?);
    let node_id = node_info.bits(16, 31) as u16;
    if node_id >= 4096 {
        return Err(CmnError::HardwareAssertion(format!(
            "node at {reg_base:#x} has node_id {node_id} >= 4096"
        )));
    }
    let logical_id = node_info.bits(32, 47) as u16;
    let child_info = Register::new(mmio.read64(reg_base + 0x80)?);
    let child_count = child_info.bits(0, 15) as u32;
    let child_ptr_offset = child_info.bits(16, 31) as u32;
    Ok((node_id, logical_id, child_count, child_ptr_offset))
}

/// Reads one child pointer slot, returning `None` if it is flagged external
/// (logged and skipped, never fatal).
fn read_child(
    mmio: &MmioWindow,
    parent_log: &str,
    child_ptr_offset: u64,
) -> Result<Option<(u64, u16, u16, u16)>> {
    let ptr = Register::new(mmio.read64(child_ptr_offset)?);
    if ptr.bit(31) {
        log::warn!("{parent_log}: ignoring external child node");
        return Ok(None);
    }
    let node_offset = ptr.bits(0, 29);
    let node_info = Register::new(mmio.read64(node_offset)?);
    let type_tag = node_info.bits(0, 15) as u16;
    let node_id = node_info.bits(16, 31) as u16;
    let logical_id = node_info.bits(32, 47) as u16;
    Ok(Some((node_offset, type_tag, node_id, logical_id)))
}

fn probe_xp_list(mmio: &MmioWindow) -> Result<Vec<RawChild>> {
    let (_root_id, _root_logical, child_count, child_ptr_offset) = read_node_common(mmio, 0)?;
    let mut xps = Vec::new();
    for i in 0..child_count {
        let slot = child_ptr_offset as u64 + 8 * i as u64;
        let Some((offset, type_tag, node_id, logical_id)) = read_child(mmio, "CFG", slot)? else {
            continue;
        };
        if type_tag != XP_TAG {
            return Err(CmnError::HardwareAssertion(format!(
                "CFG child at {offset:#x} has type tag {type_tag:#06x}, expected XP (0x0006)"
            )));
        }
        xps.push(RawChild {
            node_id,
            logical_id,
            reg_base: offset,
            kind: NodeKind::Xp,
        });
    }
    Ok(xps)
}

fn mesh_dimensions(xps: &[RawChild]) -> Result<(u32, u32)> {
    let xdim = xps
        .iter()
        .find(|xp| xp.node_id == 8)
        .map(|xp| xp.logical_id as u32)
        .unwrap_or(1);
    if xdim == 0 {
        return Err(CmnError::HardwareAssertion("xdim computed as 0".into()));
    }
    let total = xps.len() as u32;
    if total % xdim != 0 {
        return Err(CmnError::HardwareAssertion(format!(
            "{total} XPs not evenly divisible by xdim {xdim}"
        )));
    }
    let ydim = total / xdim;
    if !(1..=16).contains(&xdim) || !(1..=16).contains(&ydim) {
        return Err(CmnError::HardwareAssertion(format!(
            "mesh dimensions out of range: xdim={xdim} ydim={ydim}"
        )));
    }
    Ok((xdim, ydim))
}

fn xp_coordinates(node_id: u16, xdim: u32, ydim: u32) -> (u32, u32) {
    let xshift = ceil_log2(std::cmp::max(xdim, ydim)).max(2);
    let xy = (node_id >> 3) as u32;
    let x = xy >> xshift;
    let y = xy & ((1 << xshift) - 1);
    (x, y)
}

fn probe_ports(mmio: &MmioWindow, reg_base: u64, port_count: u8) -> Result<Vec<PortInfo>> {
    let mut ports = Vec::with_capacity(port_count as usize);
    for i in 0..port_count as u64 {
        let conn = Register::new(mmio.read64(reg_base + 8 + 8 * i)?);
        let device_type = conn.bits(0, 4) as u8;
        let info = Register::new(mmio.read64(reg_base + 0x900 + 16 * i)?);
        let device_count = info.bits(0, 2) as u8;
        ports.push(PortInfo {
            device_type,
            device_count,
        });
    }
    Ok(ports)
}

struct ProbedXp {
    xp: Xp,
    raw_devices: Vec<(DeviceNode, NodeKind)>,
}

fn probe_xp(mmio: &MmioWindow, raw: &RawChild, multi_dtm_enabled: bool) -> Result<(ProbedXp, Vec<Dtc>)> {
    let reg_base = raw.reg_base;
    let (node_id, logical_id, child_count, child_ptr_offset) = read_node_common(mmio, reg_base)?;
    if node_id & 0x7 != 0 {
        return Err(CmnError::HardwareAssertion(format!(
            "XP node_id {node_id} has nonzero low 3 bits"
        )));
    }
    let node_info = Register::new(mmio.read64(reg_base)?);
    let port_count = node_info.bits(48, 51) as u8;
    let dtc_domain = Register::new(mmio.read64(reg_base + 0x960)?).bits(0, 1) as u8;
    let ports = probe_ports(mmio, reg_base, port_count)?;

    let mut raw_devices = Vec::new();
    let mut dtcs = Vec::new();
    for i in 0..child_count {
        let slot = reg_base + child_ptr_offset as u64 + 8 * i as u64;
        let log_tag = format!("XP{node_id}");
        let Some((offset, type_tag, dev_node_id, dev_logical_id)) =
            read_child(mmio, &log_tag, slot)?
        else {
            continue;
        };
        let Some(kind) = NodeKind::from_tag(type_tag) else {
            log::warn!("{log_tag}: ignoring unknown node type {type_tag:#06x}");
            continue;
        };
        if kind == NodeKind::Dtc {
            let node_info = Register::new(mmio.read64(offset)?);
            let domain = node_info.bits(32, 33) as u8;
            dtcs.push(Dtc {
                common: NodeCommon {
                    node_id: dev_node_id,
                    logical_id: dev_logical_id,
                    reg_base: offset,
                    child_count: 0,
                    child_ptr_offset: 0,
                    kind,
                },
                domain,
                active_counters: 0,
            });
            continue;
        }
        let (p, d) = DeviceNode::derive_pd(dev_node_id, port_count);
        let (_, _, dev_child_count, dev_child_ptr_offset) = read_node_common(mmio, offset)?;
        raw_devices.push((
            DeviceNode {
                common: NodeCommon {
                    node_id: dev_node_id,
                    logical_id: dev_logical_id,
                    reg_base: offset,
                    child_count: dev_child_count,
                    child_ptr_offset: dev_child_ptr_offset,
                    kind,
                },
                xp_index: usize::MAX, // patched in by the caller once xp_index is known
                p,
                d,
            },
            kind,
        ));
    }

    let xp = Xp {
        common: NodeCommon {
            node_id,
            logical_id,
            reg_base,
            child_count,
            child_ptr_offset,
            kind: NodeKind::Xp,
        },
        x: 0,
        y: 0,
        ports,
        dtc_domain,
        child_nodes: HashMap::new(),
        wp_in_use: [false; 4],
        multi_dtm_enabled,
    };
    Ok((ProbedXp { xp, raw_devices }, dtcs))
}

fn populate_child_nodes(xp: &mut Xp, mut raw_devices: Vec<DeviceNode>) {
    let mut map: HashMap<(u8, u8), Vec<DeviceNode>> = HashMap::new();
    for (p, port) in xp.ports.iter().enumerate() {
        for d in 0..port.device_count {
            map.insert((p as u8, d), Vec::new());
        }
    }
    for dev in raw_devices.drain(..) {
        match map.get_mut(&(dev.p, dev.d)) {
            Some(list) => list.push(dev),
            None => log::debug!(
                "XP{}: discarding out-of-bound child node_id={} at port{} device{}",
                xp.common.node_id,
                dev.common.node_id,
                dev.p,
                dev.d
            ),
        }
    }
    xp.child_nodes = map;
}

/// Discovers the full topology of the mesh reachable through `mmio`.
pub fn discover(mmio: MmioWindow, mesh_id: u32) -> Result<Mesh> {
    let root_info = Register::new(mmio.read64(0)?);
    let root_tag = root_info.bits(0, 15) as u16;
    if root_tag != CFG_TAG {
        return Err(CmnError::HardwareAssertion(format!(
            "root node type tag {root_tag:#06x}, expected CFG (0x0002)"
        )));
    }

    let raw_xps = probe_xp_list(&mmio)?;
    let (xdim, ydim) = mesh_dimensions(&raw_xps)?;
    let multi_dtm_enabled = Register::new(mmio.read64(0x900)?).bit(63);
    if multi_dtm_enabled {
        log::warn!("mesh {mesh_id}: multi-DTM mode detected on the CFG node");
    }

    let mut xps = Vec::with_capacity(raw_xps.len());
    let mut dtcs = Vec::new();
    let mut xp_by_node_id = HashMap::new();
    let mut grid = vec![vec![usize::MAX; ydim as usize]; xdim as usize];

    for raw in &raw_xps {
        let (mut probed, xp_dtcs) = probe_xp(&mmio, raw, multi_dtm_enabled)?;
        let (x, y) = xp_coordinates(probed.xp.common.node_id, xdim, ydim);
        probed.xp.x = x;
        probed.xp.y = y;
        probed.xp.check_multi_dtm_supported()?;

        let index = xps.len();
        let mut devices: Vec<DeviceNode> = probed
            .raw_devices
            .into_iter()
            .map(|(mut dev, _)| {
                dev.xp_index = index;
                dev
            })
            .collect();
        populate_child_nodes(&mut probed.xp, std::mem::take(&mut devices));

        grid[x as usize][y as usize] = index;
        xp_by_node_id.insert(probed.xp.common.node_id, index);
        dtcs.extend(xp_dtcs);
        xps.push(probed.xp);
    }

    dtcs.sort_by_key(|d| d.domain);
    let max_domain = dtcs.iter().map(|d| d.domain).max();
    match max_domain {
        Some(m) if (m as usize + 1) == dtcs.len() => {}
        Some(m) => {
            return Err(CmnError::HardwareAssertion(format!(
                "DTC domains not dense: max domain {m}, {} DTC nodes",
                dtcs.len()
            )))
        }
        None => {
            return Err(CmnError::HardwareAssertion(
                "mesh has no DTC nodes".to_string(),
            ))
        }
    }

    Ok(Mesh {
        mesh_id,
        mmio,
        xdim,
        ydim,
        xps,
        grid,
        xp_by_node_id,
        dtcs,
    })
}
