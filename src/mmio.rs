//! Bounded, 8-byte-aligned access to a single mesh's MMIO register window.
//!
//! Mirrors the three-operation register helper described for the kernel
//! side: `read64`, `write64`, `read64_into`. The window itself is backed by
//! `mmap`'d memory over a character device exposing raw physical offsets.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{fence, Ordering};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{CmnError, Result};

/// Either a read-only or a read-write mapping of the device file.
/// `Mmap::make_mut` requires the backing file to have been opened for
/// writing, so a window opened read-only (as `info`/discovery do) must
/// stay a plain `Mmap` rather than being forced mutable.
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Mapping::ReadOnly(m) => m.as_ptr(),
            Mapping::ReadWrite(m) => m.as_ptr(),
        }
    }

    fn is_writable(&self) -> bool {
        matches!(self, Mapping::ReadWrite(_))
    }
}

/// Filename prefix used by the kernel-side character device: one device per
/// mesh, named `armcmn:CMN<id>:<phys_base_hex>:<size_hex>`.
fn device_prefix(mesh_id: u32) -> String {
    format!("armcmn:CMN{mesh_id}:")
}

fn find_device_files(mesh_id: u32, dev_dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let prefix = device_prefix(mesh_id);
    let mut matches = Vec::new();
    let entries = match std::fs::read_dir(dev_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(matches),
    };
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(&prefix) {
                matches.push(entry.path());
            }
        }
    }
    Ok(matches)
}

fn parse_device_file(path: &std::path::Path) -> Result<(u64, u64)> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let parts: Vec<&str> = name.split(':').collect();
    if parts.len() != 4 {
        return Err(CmnError::ParseError {
            token: name.to_string(),
            reason: "expected armcmn:CMN<id>:<phys_base_hex>:<size_hex>".into(),
        });
    }
    let phys_base = u64::from_str_radix(parts[2], 16).map_err(|e| CmnError::ParseError {
        token: parts[2].to_string(),
        reason: e.to_string(),
    })?;
    let size = u64::from_str_radix(parts[3], 16).map_err(|e| CmnError::ParseError {
        token: parts[3].to_string(),
        reason: e.to_string(),
    })?;
    Ok((phys_base, size))
}

/// A mapped view over one mesh's register space.
pub struct MmioWindow {
    mmap: Mapping,
    size: u64,
    #[allow(dead_code)]
    file: File,
    pub phys_base: u64,
    pub device_path: PathBuf,
}

impl MmioWindow {
    /// Opens the device for mesh `mesh_id`, searching the usual `/dev`
    /// directory for a matching character device.
    pub fn open(mesh_id: u32, read_write: bool) -> Result<Self> {
        Self::open_in(mesh_id, read_write, std::path::Path::new("/dev"))
    }

    /// Like [`open`](Self::open) but searches an arbitrary directory; used
    /// by tests to avoid touching `/dev`.
    pub fn open_in(mesh_id: u32, read_write: bool, dev_dir: &std::path::Path) -> Result<Self> {
        let candidates = find_device_files(mesh_id, dev_dir)?;
        let path = match candidates.as_slice() {
            [] => {
                return Err(CmnError::DeviceNotPresent(format!(
                    "{}* in {}",
                    device_prefix(mesh_id),
                    dev_dir.display()
                )))
            }
            [only] => only.clone(),
            many => {
                return Err(CmnError::AmbiguousDevice(
                    device_prefix(mesh_id),
                    many.iter()
                        .map(|p| p.display().to_string())
                        .collect(),
                ))
            }
        };
        let (phys_base, size) = parse_device_file(&path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(read_write)
            .open(&path)
            .map_err(|e| CmnError::MapError(path.display().to_string(), e))?;

        let mmap = if read_write {
            let mmap_mut = unsafe { MmapOptions::new().len(size as usize).map_mut(&file) }
                .map_err(|e| CmnError::MapError(path.display().to_string(), e))?;
            Mapping::ReadWrite(mmap_mut)
        } else {
            let mmap_ro = unsafe { MmapOptions::new().len(size as usize).map(&file) }
                .map_err(|e| CmnError::MapError(path.display().to_string(), e))?;
            Mapping::ReadOnly(mmap_ro)
        };

        Ok(MmioWindow {
            mmap,
            size,
            file,
            phys_base,
            device_path: path,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_bounds(&self, off: u64) -> Result<()> {
        if off + 8 > self.size {
            return Err(CmnError::HardwareAssertion(format!(
                "register offset {off:#x} + 8 exceeds window size {:#x}",
                self.size
            )));
        }
        Ok(())
    }

    pub fn read64(&self, off: u64) -> Result<u64> {
        self.check_bounds(off)?;
        let ptr = unsafe { self.mmap.as_ptr().add(off as usize) } as *const u64;
        let v = unsafe { std::ptr::read_volatile(ptr) };
        fence(Ordering::Acquire);
        Ok(v)
    }

    pub fn write64(&self, off: u64, v: u64) -> Result<()> {
        self.check_bounds(off)?;
        if !self.mmap.is_writable() {
            return Err(CmnError::HardwareAssertion(format!(
                "write64 at {off:#x} on a read-only MMIO window ({})",
                self.device_path.display()
            )));
        }
        fence(Ordering::Release);
        let ptr = unsafe { self.mmap.as_ptr().add(off as usize) } as *mut u64;
        unsafe { std::ptr::write_volatile(ptr, v) };
        Ok(())
    }

    /// Reads 8 bytes at `off` directly into `dst`, skipping an intermediate
    /// allocation; used on the FIFO drain fast path.
    ///
    /// # Safety
    /// `dst` must be valid for a `u64` write.
    pub unsafe fn read64_into(&self, off: u64, dst: *mut u64) -> Result<()> {
        self.check_bounds(off)?;
        let ptr = self.mmap.as_ptr().add(off as usize) as *const u64;
        let v = std::ptr::read_volatile(ptr);
        fence(Ordering::Acquire);
        std::ptr::write_volatile(dst, v);
        Ok(())
    }
}
