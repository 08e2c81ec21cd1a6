//! Explicit PMU context: binds events to DTMs/DTCs, sequences enable, and
//! drives reset. Replaces the original's process-wide singleton with a
//! value callers construct and pass around, so tests can stand up a fresh
//! context per case.

pub mod dtc;
pub mod dtm;

use std::collections::HashMap;

use crate::error::{CmnError, Result};
use crate::event::Event;
use crate::mesh::Mesh;
use crate::mmio::MmioWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Stat,
    Trace,
}

/// Owns every mesh touched during a run and sequences DTM/DTC programming
/// across them.
pub struct PmuContext {
    pub meshes: HashMap<u32, Mesh>,
    pub mode: RunMode,
    /// `(mesh_index, xp_node_id)` pairs touched by `configure_events`, used
    /// to scope the enable step to the XPs actually programmed.
    touched_xps: Vec<(u32, u16)>,
}

impl PmuContext {
    pub fn new(mode: RunMode) -> Self {
        PmuContext {
            meshes: HashMap::new(),
            mode,
            touched_xps: Vec::new(),
        }
    }

    fn mesh_entry(&mut self, mesh_index: u32) -> Result<&mut Mesh> {
        if !self.meshes.contains_key(&mesh_index) {
            let mesh = Mesh::discover(mesh_index, true)?;
            self.meshes.insert(mesh_index, mesh);
        }
        Ok(self.meshes.get_mut(&mesh_index).unwrap())
    }

    /// Programs every event's watchpoint(s), allocating DTC counters in
    /// stat mode, one event at a time in the order given.
    pub fn configure_events(&mut self, events: &mut [Event]) -> Result<()> {
        for event in events.iter_mut() {
            let mesh = self.mesh_entry(event.mesh_index)?;
            let xp_index = *mesh
                .xp_by_node_id
                .get(&event.xp_nid)
                .ok_or_else(|| CmnError::HardwareAssertion(format!("no XP with node_id={}", event.xp_nid)))?;
            let dtc_domain = mesh.xps[xp_index].dtc_domain;
            let dtc_index = mesh
                .dtcs
                .iter()
                .position(|d| d.domain == dtc_domain)
                .ok_or_else(|| CmnError::HardwareAssertion(format!("no DTC for domain {dtc_domain}")))?;

            let Mesh { xps, dtcs, mmio, .. } = mesh;
            dtm::configure(&mut xps[xp_index], mmio, event, self.mode, &mut dtcs[dtc_index])?;
            self.touched_xps.push((event.mesh_index, event.xp_nid));
        }
        self.touched_xps.sort_unstable();
        self.touched_xps.dedup();
        Ok(())
    }

    /// Sequences enable: per-DTC mode configuration, per-XP `dtm_en`, then
    /// domain-0 `dt_en` for every touched mesh. `dtm_en`/`dt_en` writes are
    /// always last, never reordered.
    pub fn enable(&mut self, tracetag_xp: Option<(u32, u16)>) -> Result<()> {
        let touched_meshes: Vec<u32> = {
            let mut v: Vec<u32> = self.touched_xps.iter().map(|(m, _)| *m).collect();
            v.sort_unstable();
            v.dedup();
            v
        };

        for &mesh_index in &touched_meshes {
            let mesh = self.meshes.get_mut(&mesh_index).unwrap();
            for dtc in &mesh.dtcs {
                dtc::configure(dtc, &mesh.mmio, self.mode)?;
            }
        }
        for &(mesh_index, xp_nid) in &self.touched_xps {
            let mesh = self.meshes.get_mut(&mesh_index).unwrap();
            let xp = mesh.xp(xp_nid).unwrap();
            dtm::enable(xp, &mesh.mmio, self.mode)?;
        }
        for &mesh_index in &touched_meshes {
            let mesh = self.meshes.get_mut(&mesh_index).unwrap();
            let domain0 = &mesh.dtcs[0];
            dtc::enable0(domain0, &mesh.mmio, self.mode)?;
        }
        if let Some((mesh_index, xp_nid)) = tracetag_xp {
            if let Some(mesh) = self.meshes.get(&mesh_index) {
                if let Some(xp) = mesh.xp(xp_nid) {
                    dtm::enable_tracetag(xp, &mesh.mmio)?;
                }
            }
        }
        Ok(())
    }

    /// Triggers one snapshot cycle on every touched mesh's domain-0 DTC,
    /// then reads and composes the 48-bit counter for every event.
    pub fn snapshot(&self, events: &[Event]) -> Result<Vec<(String, u64)>> {
        let mut triggered: Vec<u32> = Vec::new();
        for event in events {
            if !triggered.contains(&event.mesh_index) {
                let mesh = self.meshes.get(&event.mesh_index).ok_or_else(|| {
                    CmnError::HardwareAssertion(format!("mesh {} not configured", event.mesh_index))
                })?;
                dtc::trigger_snapshot(&mesh.dtcs[0], &mesh.mmio)?;
                triggered.push(event.mesh_index);
            }
        }

        let mut results = Vec::with_capacity(events.len());
        for event in events {
            let mesh = self.meshes.get(&event.mesh_index).unwrap();
            let xp = mesh.xp(event.xp_nid).unwrap();
            let pmu_info = event
                .pmu_info
                .ok_or_else(|| CmnError::HardwareAssertion(format!("event {} not configured", event.name)))?;
            let dtc = mesh
                .dtcs
                .iter()
                .find(|d| d.domain == xp.dtc_domain)
                .ok_or_else(|| CmnError::HardwareAssertion(format!("no DTC for domain {}", xp.dtc_domain)))?;

            let dtm_count = dtm::read_shadow_counter(xp, &mesh.mmio, pmu_info.wp_index)?;
            let dtc_count = dtc::read_shadow_counter(dtc, &mesh.mmio, pmu_info.dtc_counter_index as u8)?;
            let combined = ((dtc_count as u64) << 16) | dtm_count as u64;
            results.push((event.name.clone(), combined));
        }
        Ok(results)
    }

    /// Resets every register this driver programs, across every mesh ever
    /// opened in this context: domain-0 DTC first, then remaining DTCs,
    /// then every XP. Safe to call more than once.
    pub fn reset(&mut self) -> Result<()> {
        for mesh in self.meshes.values_mut() {
            for dtc in mesh.dtcs.iter_mut() {
                dtc::reset(dtc, &mesh.mmio)?;
            }
            for xp in mesh.xps.iter_mut() {
                dtm::reset(xp, &mesh.mmio)?;
            }
        }
        Ok(())
    }

    pub fn mmio_for(&self, mesh_index: u32) -> Option<&MmioWindow> {
        self.meshes.get(&mesh_index).map(|m| &m.mmio)
    }
}
