//! Address-space-agnostic MMU state shared by both memory models.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cpu::CpuCore;
use crate::page::{PageSizeProfile, PageTableAllocator, PageTableId};
use crate::{MmuConfig, Protection, VmAddress};

/// Base of the globally-visible address range.
const GLOBAL_BASE: VmAddress = 0x8000_0000;
/// Global base under the legacy memory map layout.
const GLOBAL_BASE_LEGACY: VmAddress = 0x4000_0000;

/// Shared state of every MMU model: the table allocator, the CPU handle, the
/// selected page-size profile and the behavior toggles.
pub struct MmuBase {
    alloc: Rc<RefCell<PageTableAllocator>>,
    cpu: Rc<RefCell<dyn CpuCore>>,
    config: MmuConfig,
    profile: PageSizeProfile,
    legacy_map: bool,
}

impl MmuBase {
    pub fn new(
        alloc: Rc<RefCell<PageTableAllocator>>,
        cpu: Rc<RefCell<dyn CpuCore>>,
        config: MmuConfig,
        page_size_bits: u32,
        legacy_map: bool,
    ) -> Self {
        Self {
            alloc,
            cpu,
            config,
            profile: PageSizeProfile::select(page_size_bits),
            legacy_map,
        }
    }

    #[inline]
    pub fn profile(&self) -> &PageSizeProfile {
        &self.profile
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.profile.page_size()
    }

    #[inline]
    pub fn page_size_bits(&self) -> u32 {
        self.profile.page_size_bits
    }

    #[inline]
    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    #[inline]
    pub fn legacy_map(&self) -> bool {
        self.legacy_map
    }

    /// Whether `addr` falls in the globally-visible half of the map.
    #[inline]
    pub fn is_global_address(&self, addr: VmAddress) -> bool {
        let base = if self.legacy_map {
            GLOBAL_BASE_LEGACY
        } else {
            GLOBAL_BASE
        };
        addr >= base
    }

    pub fn allocator(&self) -> &Rc<RefCell<PageTableAllocator>> {
        &self.alloc
    }

    /// Vends a fresh page table sized by the configured exponent.
    pub fn create_new_page_table(&self) -> PageTableId {
        self.alloc
            .borrow_mut()
            .create_new(self.profile.page_size_bits)
    }

    /// Feeds a host-backed region into the CPU's fast translation cache.
    pub fn map_to_cpu(&self, addr: VmAddress, size: usize, host: *mut u8, perm: Protection) {
        self.cpu.borrow_mut().map_backing_mem(addr, size, host, perm);
    }

    /// Drops a region from the CPU's fast translation cache.
    pub fn unmap_from_cpu(&self, addr: VmAddress, size: usize) {
        self.cpu.borrow_mut().unmap_memory(addr, size);
    }
}
