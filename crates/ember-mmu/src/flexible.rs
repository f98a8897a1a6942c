//! The flexible memory model.
//!
//! Every address space owns a sparse chunk directory created on demand;
//! nothing is implicitly shared between processes. The globally-visible half
//! of the map lives in its own directory consulted for every space.

use std::collections::HashMap;

use crate::page::{PageInfo, PageSizeProfile, PageTableId};
use crate::{Asid, MemModel, Mmu, MmuBase, Protection, RegionError, VmAddress, CURRENT_ASID};

#[derive(Default)]
struct ChunkDirectory {
    chunks: HashMap<u32, PageTableId>,
}

pub struct FlexibleMmu {
    base: MmuBase,
    global: ChunkDirectory,
    spaces: HashMap<Asid, ChunkDirectory>,
    current: Asid,
}

impl FlexibleMmu {
    pub fn new(base: MmuBase) -> Self {
        Self {
            base,
            global: ChunkDirectory::default(),
            spaces: HashMap::new(),
            current: 0,
        }
    }

    #[inline]
    fn resolve(&self, asid: Asid) -> Asid {
        if asid == CURRENT_ASID {
            self.current
        } else {
            asid
        }
    }

    fn walk(&self, dir: &ChunkDirectory, profile: &PageSizeProfile, addr: VmAddress) -> *mut u8 {
        let Some(tid) = dir.chunks.get(&(profile.chunk_index(addr) as u32)).copied() else {
            return std::ptr::null_mut();
        };
        let alloc = self.base.allocator().borrow();
        let Some(page) = alloc
            .get(tid)
            .and_then(|table| table.page(profile.page_index(addr)))
            .copied()
        else {
            return std::ptr::null_mut();
        };
        if !page.is_mapped() {
            return std::ptr::null_mut();
        }
        page.host.wrapping_add(profile.page_offset(addr) as usize)
    }

    /// Attaches or detaches every mapping of one space from the CPU fast
    /// path, page by page.
    fn sync_space_to_cpu(&self, asid: Asid, attach: bool) {
        let Some(dir) = self.spaces.get(&asid) else {
            return;
        };
        let profile = *self.base.profile();
        let alloc = self.base.allocator().borrow();
        for (&ci, &tid) in &dir.chunks {
            let Some(table) = alloc.get(tid) else { continue };
            for (pi, page) in table.mapped_pages() {
                let page_addr = (ci << profile.chunk_shift) | ((pi as u32) << profile.page_index_shift);
                if attach {
                    self.base
                        .map_to_cpu(page_addr, profile.page_size() as usize, page.host, page.perm);
                } else {
                    self.base
                        .unmap_from_cpu(page_addr, profile.page_size() as usize);
                }
            }
        }
    }
}

impl Mmu for FlexibleMmu {
    fn base(&self) -> &MmuBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MmuBase {
        &mut self.base
    }

    fn model(&self) -> MemModel {
        MemModel::Flexible
    }

    fn current_address_space(&self) -> Asid {
        self.current
    }

    fn set_current_address_space(&mut self, asid: Asid) {
        let asid = self.resolve(asid);
        if asid == self.current {
            return;
        }
        self.sync_space_to_cpu(self.current, false);
        self.current = asid;
        self.sync_space_to_cpu(self.current, true);
    }

    fn get_host_pointer(&mut self, asid: Asid, addr: VmAddress) -> *mut u8 {
        let profile = *self.base.profile();
        if self.base.is_global_address(addr) {
            return self.walk(&self.global, &profile, addr);
        }
        let resolved = self.resolve(asid);
        match self.spaces.get(&resolved) {
            Some(dir) => self.walk(dir, &profile, addr),
            None => std::ptr::null_mut(),
        }
    }

    fn map_region(
        &mut self,
        asid: Asid,
        addr: VmAddress,
        host: *mut u8,
        size: usize,
        perm: Protection,
    ) -> Result<(), RegionError> {
        let profile = *self.base.profile();
        if addr & profile.offset_mask != 0 {
            return Err(RegionError::Unaligned { addr });
        }
        let page_size = profile.page_size() as usize;
        let pages = size.div_ceil(page_size);
        if pages == 0 {
            return Ok(());
        }
        if (addr as u64) + (pages * page_size) as u64 - 1 > u32::MAX as u64 {
            return Err(RegionError::RangeOverflow { addr, size });
        }

        let is_global = self.base.is_global_address(addr);
        let resolved = self.resolve(asid);
        let visible = is_global || resolved == self.current;

        for i in 0..pages {
            let page_addr = addr + (i * page_size) as u32;
            let page_host = host.wrapping_add(i * page_size);

            let dir = if is_global {
                &mut self.global
            } else {
                self.spaces.entry(resolved).or_default()
            };
            let chunk = profile.chunk_index(page_addr) as u32;
            let tid = match dir.chunks.get(&chunk) {
                Some(tid) => *tid,
                None => {
                    let tid = self.base.create_new_page_table();
                    dir.chunks.insert(chunk, tid);
                    tid
                }
            };

            self.base
                .allocator()
                .borrow_mut()
                .get_mut(tid)
                .expect("table vended by this allocator")
                .set_page(
                    profile.page_index(page_addr),
                    PageInfo {
                        host: page_host,
                        perm,
                    },
                );

            if visible {
                self.base.map_to_cpu(page_addr, page_size, page_host, perm);
            }
        }
        Ok(())
    }

    fn unmap_region(
        &mut self,
        asid: Asid,
        addr: VmAddress,
        size: usize,
    ) -> Result<(), RegionError> {
        let profile = *self.base.profile();
        if addr & profile.offset_mask != 0 {
            return Err(RegionError::Unaligned { addr });
        }
        let page_size = profile.page_size() as usize;
        let pages = size.div_ceil(page_size);
        if pages == 0 {
            return Ok(());
        }

        let is_global = self.base.is_global_address(addr);
        let resolved = self.resolve(asid);
        let visible = is_global || resolved == self.current;

        let dir = if is_global {
            &self.global
        } else {
            self.spaces
                .get(&resolved)
                .ok_or(RegionError::UnknownAddressSpace { asid: resolved })?
        };

        let mut any_cleared = false;
        for i in 0..pages {
            let page_addr = addr + (i * page_size) as u32;
            let chunk = profile.chunk_index(page_addr) as u32;
            let Some(tid) = dir.chunks.get(&chunk).copied() else {
                continue;
            };
            let index = profile.page_index(page_addr);
            let mut alloc = self.base.allocator().borrow_mut();
            let table = alloc.get_mut(tid).expect("table vended by this allocator");
            if table.page(index).is_some_and(|p| p.is_mapped()) {
                table.clear_page(index);
                any_cleared = true;
                if visible {
                    self.base.unmap_from_cpu(page_addr, page_size);
                }
            }
        }

        if !any_cleared {
            return Err(RegionError::NotMapped {
                addr,
                size,
                asid: resolved,
            });
        }
        Ok(())
    }
}
