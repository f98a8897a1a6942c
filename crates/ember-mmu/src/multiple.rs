//! The multiple memory model.
//!
//! One dense global page directory is shared by every process; each address
//! space additionally owns a local directory for the lower half of the map.
//! Switching the current address space re-points the local half only, so
//! global mappings survive every switch.

use std::collections::HashMap;

use crate::page::{PageInfo, PageSizeProfile, PageTableId};
use crate::{Asid, MemModel, Mmu, MmuBase, Protection, RegionError, VmAddress, CURRENT_ASID};

struct PageDirectory {
    tables: Vec<Option<PageTableId>>,
}

impl PageDirectory {
    fn new(chunk_count: usize) -> Self {
        Self {
            tables: vec![None; chunk_count],
        }
    }
}

pub struct MultipleMmu {
    base: MmuBase,
    global_dir: PageDirectory,
    local_dirs: HashMap<Asid, PageDirectory>,
    current: Asid,
}

impl MultipleMmu {
    pub fn new(base: MmuBase) -> Self {
        let chunk_count = base.profile().chunk_count();
        Self {
            base,
            global_dir: PageDirectory::new(chunk_count),
            local_dirs: HashMap::new(),
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

    fn checked_extent(
        profile: &PageSizeProfile,
        addr: VmAddress,
        size: usize,
    ) -> Result<(usize, usize), RegionError> {
        if addr & profile.offset_mask != 0 {
            return Err(RegionError::Unaligned { addr });
        }
        let page_size = profile.page_size() as usize;
        let pages = size.div_ceil(page_size);
        let total = pages * page_size;
        if total > 0 && (addr as u64) + total as u64 - 1 > u32::MAX as u64 {
            return Err(RegionError::RangeOverflow { addr, size });
        }
        Ok((pages, total))
    }

    /// Attaches or detaches one local directory's mappings from the CPU fast
    /// path. Used when the current address space changes.
    fn sync_local_to_cpu(&self, asid: Asid, attach: bool) {
        let Some(dir) = self.local_dirs.get(&asid) else {
            return;
        };
        let profile = *self.base.profile();
        let alloc = self.base.allocator().borrow();
        for (ci, slot) in dir.tables.iter().enumerate() {
            let Some(tid) = slot else { continue };
            let Some(table) = alloc.get(*tid) else {
                continue;
            };
            for (pi, page) in table.mapped_pages() {
                let page_addr =
                    ((ci as u32) << profile.chunk_shift) | ((pi as u32) << profile.page_index_shift);
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

impl Mmu for MultipleMmu {
    fn base(&self) -> &MmuBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MmuBase {
        &mut self.base
    }

    fn model(&self) -> MemModel {
        MemModel::Multiple
    }

    fn current_address_space(&self) -> Asid {
        self.current
    }

    fn set_current_address_space(&mut self, asid: Asid) {
        let asid = self.resolve(asid);
        if asid == self.current {
            return;
        }
        self.sync_local_to_cpu(self.current, false);
        self.current = asid;
        self.sync_local_to_cpu(self.current, true);
    }

    fn get_host_pointer(&mut self, asid: Asid, addr: VmAddress) -> *mut u8 {
        let profile = *self.base.profile();
        let dir = if self.base.is_global_address(addr) {
            &self.global_dir
        } else {
            let resolved = self.resolve(asid);
            match self.local_dirs.get(&resolved) {
                Some(dir) => dir,
                None => return std::ptr::null_mut(),
            }
        };

        let Some(Some(tid)) = dir.tables.get(profile.chunk_index(addr)).copied() else {
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

    fn map_region(
        &mut self,
        asid: Asid,
        addr: VmAddress,
        host: *mut u8,
        size: usize,
        perm: Protection,
    ) -> Result<(), RegionError> {
        let profile = *self.base.profile();
        let (pages, total) = Self::checked_extent(&profile, addr, size)?;
        if pages == 0 {
            return Ok(());
        }

        let is_global = self.base.is_global_address(addr);
        let resolved = self.resolve(asid);
        let page_size = profile.page_size() as usize;

        for i in 0..pages {
            let page_addr = addr + (i * page_size) as u32;
            let page_host = host.wrapping_add(i * page_size);

            let chunk_count = profile.chunk_count();
            let dir = if is_global {
                &mut self.global_dir
            } else {
                self.local_dirs
                    .entry(resolved)
                    .or_insert_with(|| PageDirectory::new(chunk_count))
            };

            let slot = &mut dir.tables[profile.chunk_index(page_addr)];
            let tid = match slot {
                Some(tid) => *tid,
                None => {
                    let tid = self.base.create_new_page_table();
                    *slot = Some(tid);
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
        }

        if is_global || resolved == self.current {
            self.base.map_to_cpu(addr, total, host, perm);
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
        let (pages, total) = Self::checked_extent(&profile, addr, size)?;
        if pages == 0 {
            return Ok(());
        }

        let is_global = self.base.is_global_address(addr);
        let resolved = self.resolve(asid);
        let page_size = profile.page_size() as usize;

        let dir = if is_global {
            &self.global_dir
        } else {
            self.local_dirs
                .get(&resolved)
                .ok_or(RegionError::UnknownAddressSpace { asid: resolved })?
        };

        let mut any_cleared = false;
        for i in 0..pages {
            let page_addr = addr + (i * page_size) as u32;
            let Some(Some(tid)) = dir.tables.get(profile.chunk_index(page_addr)).copied() else {
                continue;
            };
            let mut alloc = self.base.allocator().borrow_mut();
            let table = alloc
                .get_mut(tid)
                .expect("table vended by this allocator");
            let index = profile.page_index(page_addr);
            if table.page(index).is_some_and(|p| p.is_mapped()) {
                table.clear_page(index);
                any_cleared = true;
            }
        }

        if !any_cleared {
            return Err(RegionError::NotMapped {
                addr,
                size,
                asid: resolved,
            });
        }

        if is_global || resolved == self.current {
            self.base.unmap_from_cpu(addr, total);
        }
        Ok(())
    }
}
