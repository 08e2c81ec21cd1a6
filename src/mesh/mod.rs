//! The node tree and mesh aggregator (§3/§4.2 of the topology model).

pub mod discovery;
pub mod node;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CmnError, Result};
use crate::mmio::MmioWindow;

use node::{Dtc, Xp};

/// Aggregates a single CMN instance's crosspoints and debug trace
/// controllers once topology discovery has run.
pub struct Mesh {
    pub mesh_id: u32,
    pub mmio: MmioWindow,
    pub xdim: u32,
    pub ydim: u32,
    /// XPs in discovery order; `grid[x][y]` and `xp_by_node_id` index into
    /// this vector.
    pub xps: Vec<Xp>,
    pub grid: Vec<Vec<usize>>,
    pub xp_by_node_id: HashMap<u16, usize>,
    /// DTC nodes sorted by domain; `dtcs[0]` is always domain 0.
    pub dtcs: Vec<Dtc>,
}

impl Mesh {
    pub fn discover(mesh_id: u32, read_write: bool) -> Result<Self> {
        let mmio = MmioWindow::open(mesh_id, read_write)?;
        discovery::discover(mmio, mesh_id)
    }

    pub fn xp(&self, node_id: u16) -> Option<&Xp> {
        self.xp_by_node_id.get(&node_id).map(|&i| &self.xps[i])
    }

    pub fn xp_mut(&mut self, node_id: u16) -> Option<&mut Xp> {
        match self.xp_by_node_id.get(&node_id) {
            Some(&i) => Some(&mut self.xps[i]),
            None => None,
        }
    }

    /// Computes the node id a device at `(p, d)` on `xp` is expected to
    /// have, and cross-checks it against any discovered child node there.
    pub fn dev_node_id(xp: &Xp, p: u8, d: u8) -> Result<u16> {
        let port_count = xp.ports.len();
        let node_id = if port_count <= 2 {
            ((p as u16) << 2) | (d as u16)
        } else {
            ((p as u16) << 1) | (d as u16)
        } + xp.common.node_id;
        if let Some(children) = xp.child_nodes.get(&(p, d)) {
            if let Some(first) = children.first() {
                if first.common.node_id != node_id {
                    return Err(CmnError::HardwareAssertion(format!(
                        "derived node_id {node_id} does not match discovered child node_id {}",
                        first.common.node_id
                    )));
                }
            }
        }
        Ok(node_id)
    }

    /// Builds the nested topology view dumped by the `info` subcommand.
    pub fn topology_info(&self) -> Result<TopologyInfo> {
        let mut xp_rows = Vec::with_capacity(self.xdim as usize);
        for x in 0..self.xdim as usize {
            let mut row = Vec::with_capacity(self.ydim as usize);
            for y in 0..self.ydim as usize {
                let idx = self.grid[x][y];
                let xp = &self.xps[idx];
                let mut ports = Vec::with_capacity(xp.ports.len());
                for (p, port) in xp.ports.iter().enumerate() {
                    let mut devices = Vec::with_capacity(port.device_count as usize);
                    for d in 0..port.device_count {
                        let node_id = Mesh::dev_node_id(xp, p as u8, d)?;
                        devices.push(DeviceInfo { p: p as u8, d, node_id });
                    }
                    ports.push(PortInfoJson {
                        r#type: node::device_type_name(port.device_type).to_string(),
                        devices,
                    });
                }
                row.push(XpInfo {
                    x: xp.x,
                    y: xp.y,
                    node_id: xp.common.node_id,
                    dtc_domain: xp.dtc_domain,
                    ports,
                });
            }
            xp_rows.push(row);
        }
        Ok(TopologyInfo {
            mesh_id: self.mesh_id,
            dim: Dim { x: self.xdim, y: self.ydim },
            xp: xp_rows,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Dim {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub p: u8,
    pub d: u8,
    pub node_id: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PortInfoJson {
    pub r#type: String,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct XpInfo {
    pub x: u32,
    pub y: u32,
    pub node_id: u16,
    pub dtc_domain: u8,
    pub ports: Vec<PortInfoJson>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopologyInfo {
    pub mesh_id: u32,
    pub dim: Dim,
    pub xp: Vec<Vec<XpInfo>>,
}

#[cfg(test)]
mod tests {
    use super::node::*;
    use std::collections::HashMap;

    fn xp_with(node_id: u16, port_count: u8) -> Xp {
        Xp {
            common: NodeCommon {
                node_id,
                logical_id: 0,
                reg_base: 0,
                child_count: 0,
                child_ptr_offset: 0,
                kind: NodeKind::Xp,
            },
            x: 0,
            y: 0,
            ports: vec![
                PortInfo { device_type: 0b01110, device_count: 2 };
                port_count as usize
            ],
            dtc_domain: 0,
            child_nodes: HashMap::new(),
            wp_in_use: [false; 4],
            multi_dtm_enabled: false,
        }
    }

    #[test]
    fn device_pd_derivation_matches_port_count_rule() {
        // <=2 ports: p = bit2, d = bits1:0
        assert_eq!(DeviceNode::derive_pd(0b000, 2), (0, 0));
        assert_eq!(DeviceNode::derive_pd(0b101, 2), (1, 1));
        assert_eq!(DeviceNode::derive_pd(0b111, 2), (1, 3));
        // >2 ports: p = bits2:1, d = bit0
        assert_eq!(DeviceNode::derive_pd(0b110, 4), (3, 0));
        assert_eq!(DeviceNode::derive_pd(0b001, 4), (0, 1));
    }

    #[test]
    fn multi_dtm_refused_above_two_ports() {
        let mut xp = xp_with(8, 3);
        xp.multi_dtm_enabled = true;
        assert!(xp.check_multi_dtm_supported().is_err());
        xp.multi_dtm_enabled = false;
        assert!(xp.check_multi_dtm_supported().is_ok());
        let mut xp2 = xp_with(8, 2);
        xp2.multi_dtm_enabled = true;
        assert!(xp2.check_multi_dtm_supported().is_ok());
    }
}
