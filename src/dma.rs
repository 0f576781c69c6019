// Author: Lukas Bower
// Purpose: DMA mapping arena; transfers buffer ownership to the device while mapped.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// A bus address handed back by [`DmaArena::map`]. Address zero is never
/// issued, so a zeroed descriptor is always recognisably unarmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusAddr(u64);

impl BusAddr {
    /// Raw address value, as written into a descriptor.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Reconstitute from a descriptor field.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Offset the address within a mapped region.
    #[must_use]
    pub fn offset(self, by: usize) -> Self {
        Self(self.0 + by as u64)
    }
}

/// Mapping table shared between the driver and the device model.
///
/// `map` consumes the buffer: while a region is mapped the bytes are only
/// reachable through the device-side accessors, which is the ownership rule
/// DMA imposes. `unmap` returns the buffer to the caller. Regions are keyed
/// by their base address; device accesses may land anywhere inside a region.
#[derive(Debug, Default)]
pub struct DmaArena {
    inner: Mutex<ArenaInner>,
}

#[derive(Debug)]
struct ArenaInner {
    regions: BTreeMap<u64, Box<[u8]>>,
    next_base: u64,
}

impl Default for ArenaInner {
    fn default() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_base: 0x1000,
        }
    }
}

impl DmaArena {
    /// Empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a buffer for device access and return its bus address.
    pub fn map(&self, buf: Box<[u8]>) -> BusAddr {
        let mut inner = self.lock();
        let base = inner.next_base;
        // Bases never recycle within an arena lifetime; a stale descriptor
        // can therefore never alias a newer mapping.
        inner.next_base = base + buf.len().max(1) as u64 + 0x40;
        inner.regions.insert(base, buf);
        BusAddr(base)
    }

    /// Tear down a mapping and take the buffer back.
    pub fn unmap(&self, addr: BusAddr) -> Option<Box<[u8]>> {
        self.lock().regions.remove(&addr.0)
    }

    /// Number of live mappings.
    #[must_use]
    pub fn mapped_regions(&self) -> usize {
        self.lock().regions.len()
    }

    /// Device side: copy `len` bytes starting at `addr`, which may point
    /// into the middle of a region.
    pub fn read(&self, addr: BusAddr, len: usize) -> Option<Vec<u8>> {
        let inner = self.lock();
        let (base, region) = inner.regions.range(..=addr.0).next_back()?;
        let off = (addr.0 - base) as usize;
        if off + len > region.len() {
            return None;
        }
        Some(region[off..off + len].to_vec())
    }

    /// Device side: write bytes starting at `addr`. Returns how many bytes
    /// fit inside the region.
    pub fn write(&self, addr: BusAddr, bytes: &[u8]) -> usize {
        let mut inner = self.lock();
        let Some((base, _)) = inner
            .regions
            .range(..=addr.0)
            .next_back()
            .map(|(b, r)| (*b, r.len()))
        else {
            return 0;
        };
        let Some(region) = inner.regions.get_mut(&base) else {
            return 0;
        };
        let off = (addr.0 - base) as usize;
        if off >= region.len() {
            return 0;
        }
        let n = bytes.len().min(region.len() - off);
        region[off..off + n].copy_from_slice(&bytes[..n]);
        n
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArenaInner> {
        // Poisoning only happens if a holder panicked; the map itself is
        // still consistent, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_transfers_ownership_until_unmap() {
        let arena = DmaArena::new();
        let addr = arena.map(vec![1u8, 2, 3, 4].into_boxed_slice());
        assert_eq!(arena.mapped_regions(), 1);

        assert_eq!(arena.read(addr, 4).as_deref(), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(arena.write(addr.offset(2), &[9, 9]), 2);

        let buf = arena.unmap(addr).expect("mapping present");
        assert_eq!(&buf[..], &[1, 2, 9, 9]);
        assert_eq!(arena.mapped_regions(), 0);
        assert!(arena.unmap(addr).is_none());
    }

    #[test]
    fn interior_reads_resolve_to_owning_region() {
        let arena = DmaArena::new();
        let a = arena.map(vec![0u8; 64].into_boxed_slice());
        let b = arena.map(vec![7u8; 64].into_boxed_slice());

        assert_eq!(arena.read(a.offset(60), 4).map(|v| v.len()), Some(4));
        assert!(arena.read(a.offset(60), 8).is_none(), "read past region end");
        assert_eq!(arena.read(b, 1).as_deref(), Some(&[7u8][..]));
    }
}
