//! Physical memory map: sparse region table with byte or MMIO backing.
//!
//! Regions never overlap. Byte-backed regions are serviced here; MMIO
//! regions carry a [`DeviceId`] tag and are dispatched by the core, which
//! owns the peripheral models. Permission checks can be bypassed inside a
//! supervisor scope, a drop-guarded counter used by BAM, the opcode writer
//! and the flash internals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    /// Region permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Accesses dispatch to a peripheral model instead of bytes.
        const MMIO = 1 << 31;
    }
}

impl Perm {
    pub const RW: Perm = Perm::READ.union(Perm::WRITE);
    pub const RX: Perm = Perm::READ.union(Perm::EXEC);
    pub const RWX: Perm = Perm::READ.union(Perm::WRITE).union(Perm::EXEC);
}

/// Peripheral models reachable through MMIO regions. Dispatch happens in
/// the core, which owns the device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceId {
    /// Main flash array (4 MB at 0x0000_0000).
    FlashMain,
    /// Shadow block of flash array A.
    FlashShadowA,
    /// Shadow block of flash array B.
    FlashShadowB,
    /// Flash array A control registers.
    FlashRegsA,
    /// Flash array B control registers.
    FlashRegsB,
    /// Software watchdog timer registers.
    Swt,
    /// Boot assist module ROM window.
    Bam,
}

enum Backing {
    Bytes(Vec<u8>),
    Mmio(DeviceId),
}

/// One entry of the memory map.
pub struct Region {
    pub base: u32,
    pub size: u32,
    pub perm: Perm,
    pub name: &'static str,
    backing: Backing,
}

impl Region {
    pub fn contains(&self, pa: u32) -> bool {
        pa >= self.base && (pa as u64) < self.base as u64 + self.size as u64
    }

    pub fn device(&self) -> Option<DeviceId> {
        match self.backing {
            Backing::Mmio(dev) => Some(dev),
            Backing::Bytes(_) => None,
        }
    }
}

/// Raised when an access misses every region or fails its permission
/// check without a supervisor scope active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegViolation {
    pub pa: u32,
}

/// Drop guard for the supervisor permission override.
pub struct SupervisorGuard {
    flag: Arc<AtomicU32>,
}

impl Drop for SupervisorGuard {
    fn drop(&mut self) {
        self.flag.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The physical memory map.
pub struct MemoryMap {
    regions: Vec<Region>,
    supervisor: Arc<AtomicU32>,
}

impl MemoryMap {
    pub fn new() -> Self {
        MemoryMap {
            regions: Vec::new(),
            supervisor: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Enter the supervisor scope; permission checks pass until the guard
    /// drops. Nesting is allowed.
    pub fn supervisor(&self) -> SupervisorGuard {
        self.supervisor.fetch_add(1, Ordering::SeqCst);
        SupervisorGuard { flag: self.supervisor.clone() }
    }

    pub fn in_supervisor(&self) -> bool {
        self.supervisor.load(Ordering::SeqCst) > 0
    }

    fn check_overlap(&self, base: u32, size: u32, name: &'static str) {
        let end = base as u64 + size as u64;
        for r in &self.regions {
            let r_end = r.base as u64 + r.size as u64;
            assert!(
                end <= r.base as u64 || base as u64 >= r_end,
                "region {} overlaps {}",
                name,
                r.name
            );
        }
    }

    /// Install a byte-backed region. `align` pads the backing up to a
    /// multiple of the given size.
    pub fn add_region(
        &mut self,
        base: u32,
        perm: Perm,
        name: &'static str,
        mut bytes: Vec<u8>,
        align: Option<usize>,
    ) {
        if let Some(a) = align {
            let rem = bytes.len() % a;
            if rem != 0 {
                bytes.resize(bytes.len() + a - rem, 0);
            }
        }
        let size = bytes.len() as u32;
        self.check_overlap(base, size, name);
        self.regions.push(Region {
            base,
            size,
            perm: perm - Perm::MMIO,
            name,
            backing: Backing::Bytes(bytes),
        });
        self.regions.sort_by_key(|r| r.base);
    }

    /// Install a dispatch region routed to a peripheral model.
    pub fn add_mmio(&mut self, base: u32, size: u32, name: &'static str, dev: DeviceId, perm: Perm) {
        self.check_overlap(base, size, name);
        self.regions.push(Region {
            base,
            size,
            perm: perm | Perm::MMIO,
            name,
            backing: Backing::Mmio(dev),
        });
        self.regions.sort_by_key(|r| r.base);
    }

    /// Locate the region containing `[pa, pa+size)`.
    pub fn find(&self, pa: u32, size: u32) -> Result<&Region, SegViolation> {
        self.regions
            .iter()
            .find(|r| r.contains(pa) && pa as u64 + size as u64 <= r.base as u64 + r.size as u64)
            .ok_or(SegViolation { pa })
    }

    fn find_checked(&self, pa: u32, size: u32, need: Perm) -> Result<&Region, SegViolation> {
        let region = self.find(pa, size)?;
        if !region.perm.contains(need) && !self.in_supervisor() {
            return Err(SegViolation { pa });
        }
        Ok(region)
    }

    /// Read from a byte-backed region; MMIO regions return the device tag
    /// for the caller to dispatch.
    pub fn read(&self, pa: u32, size: u32) -> Result<ReadAccess<'_>, SegViolation> {
        let region = self.find_checked(pa, size, Perm::READ)?;
        let offset = (pa - region.base) as usize;
        match &region.backing {
            Backing::Bytes(b) => Ok(ReadAccess::Bytes(&b[offset..offset + size as usize])),
            Backing::Mmio(dev) => Ok(ReadAccess::Mmio { dev: *dev, offset: offset as u32 }),
        }
    }

    /// Write to a byte-backed region; MMIO regions return the device tag.
    pub fn write(&mut self, pa: u32, bytes: &[u8]) -> Result<WriteAccess, SegViolation> {
        let size = bytes.len() as u32;
        let (is_exec, result) = {
            let region = self.find_checked(pa, size, Perm::WRITE)?;
            let offset = (pa - region.base) as usize;
            match &region.backing {
                Backing::Bytes(_) => (region.perm.contains(Perm::EXEC), None),
                Backing::Mmio(dev) => (
                    region.perm.contains(Perm::EXEC),
                    Some(WriteAccess::Mmio { dev: *dev, offset: offset as u32 }),
                ),
            }
        };
        if let Some(access) = result {
            return Ok(access);
        }
        // second lookup for the mutable slice; region table is small
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.contains(pa))
            .expect("region vanished");
        let offset = (pa - region.base) as usize;
        if let Backing::Bytes(b) = &mut region.backing {
            b[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        Ok(WriteAccess::Done { exec: is_exec })
    }

    /// Bytes underlying an executable address, for the instruction decoder.
    /// MMIO regions are resolved by the caller through the device tag.
    pub fn exec_bytes(&self, pa: u32, size: u32) -> Result<ReadAccess<'_>, SegViolation> {
        let region = self.find(pa, size)?;
        let offset = (pa - region.base) as usize;
        match &region.backing {
            Backing::Bytes(b) => Ok(ReadAccess::Bytes(&b[offset..offset + size as usize])),
            Backing::Mmio(dev) => Ok(ReadAccess::Mmio { dev: *dev, offset: offset as u32 }),
        }
    }

    /// Whether a write at `pa` can invalidate cached opcodes.
    pub fn is_exec(&self, pa: u32) -> bool {
        self.regions
            .iter()
            .any(|r| r.contains(pa) && r.perm.contains(Perm::EXEC))
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a map-level read.
pub enum ReadAccess<'a> {
    Bytes(&'a [u8]),
    Mmio { dev: DeviceId, offset: u32 },
}

/// Outcome of a map-level write.
pub enum WriteAccess {
    /// Bytes were stored; `exec` reports whether the region is executable
    /// (so the opcode cache must be invalidated).
    Done { exec: bool },
    Mmio { dev: DeviceId, offset: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> MemoryMap {
        let mut map = MemoryMap::new();
        map.add_region(0x4000_0000, Perm::RWX, "sram", vec![0u8; 0x1000], None);
        map.add_region(0x1000_0000, Perm::READ, "rom", vec![0xAA; 0x100], None);
        map.add_mmio(0xFFF3_8000, 0x4000, "swt", DeviceId::Swt, Perm::RW);
        map
    }

    #[test]
    fn test_read_write_bytes() {
        let mut map = sample_map();
        match map.write(0x4000_0010, &[1, 2, 3, 4]).unwrap() {
            WriteAccess::Done { exec } => assert!(exec),
            _ => panic!("expected byte write"),
        }
        match map.read(0x4000_0010, 4).unwrap() {
            ReadAccess::Bytes(b) => assert_eq!(b, &[1, 2, 3, 4]),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn test_unmapped_raises() {
        let map = sample_map();
        assert_eq!(map.read(0x9000_0000, 4).err(), Some(SegViolation { pa: 0x9000_0000 }));
    }

    #[test]
    fn test_access_spanning_region_end_raises() {
        let map = sample_map();
        assert!(map.read(0x4000_0FFE, 4).is_err());
    }

    #[test]
    fn test_permission_denied() {
        let mut map = sample_map();
        assert!(map.write(0x1000_0000, &[0]).is_err());
    }

    #[test]
    fn test_supervisor_override_scoped() {
        let mut map = sample_map();
        {
            let _guard = map.supervisor();
            assert!(map.in_supervisor());
        }
        assert!(!map.in_supervisor());

        let guard = map.supervisor();
        // write through the read-only region under supervisor
        let ok = {
            let _g = &guard;
            map.write(0x1000_0000, &[0x55]).is_ok()
        };
        assert!(ok);
        drop(guard);
        assert!(map.write(0x1000_0000, &[0x55]).is_err());
    }

    #[test]
    fn test_supervisor_nesting() {
        let map = sample_map();
        let g1 = map.supervisor();
        let g2 = map.supervisor();
        drop(g1);
        assert!(map.in_supervisor());
        drop(g2);
        assert!(!map.in_supervisor());
    }

    #[test]
    fn test_mmio_dispatch_tag() {
        let mut map = sample_map();
        match map.read(0xFFF3_8000, 4).unwrap() {
            ReadAccess::Mmio { dev, offset } => {
                assert_eq!(dev, DeviceId::Swt);
                assert_eq!(offset, 0);
            }
            _ => panic!("expected mmio"),
        }
        match map.write(0xFFF3_8010, &[0, 0, 0xC5, 0x20]).unwrap() {
            WriteAccess::Mmio { dev, offset } => {
                assert_eq!(dev, DeviceId::Swt);
                assert_eq!(offset, 0x10);
            }
            _ => panic!("expected mmio"),
        }
    }

    #[test]
    fn test_alignment_padding() {
        let mut map = sample_map();
        map.add_region(0x5000_0000, Perm::RW, "pad", vec![0u8; 10], Some(16));
        let r = map.find(0x5000_0000, 16).unwrap();
        assert_eq!(r.size, 16);
    }

    #[test]
    #[should_panic]
    fn test_overlap_rejected() {
        let mut map = sample_map();
        map.add_region(0x4000_0800, Perm::RW, "bad", vec![0u8; 0x1000], None);
    }
}
