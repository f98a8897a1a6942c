//! Guest MMU and host memory translation.
//!
//! Bridges 32-bit guest virtual addresses to host memory for the emulated
//! CPU. The address-space-agnostic base handles sized guest reads/writes and
//! the CPU fast-path mapping calls; concrete translation lives in one of two
//! memory models behind the [`Mmu`] trait:
//!
//! - **multiple**: one global page directory shared by every process plus
//!   per-process local directories, switched by address-space id
//! - **flexible**: fully per-process sparse chunk directories
//!
//! Unmapped access never faults the host: sized I/O returns `false` and the
//! calling CPU decides whether to raise a guest abort.

mod base;
mod cpu;
mod flexible;
mod multiple;
mod page;

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;
use tracing::trace;

pub use base::MmuBase;
pub use cpu::{CpuCore, MemoryIo, MmuIoAdapter};
pub use flexible::FlexibleMmu;
pub use multiple::MultipleMmu;
pub use page::{PageInfo, PageSizeProfile, PageTable, PageTableAllocator, PageTableId};

/// Guest virtual address.
pub type VmAddress = u32;

/// Address-space id. [`CURRENT_ASID`] denotes the current context.
pub type Asid = i32;

/// The "whatever address space is current" id.
pub const CURRENT_ASID: Asid = -1;

bitflags! {
    /// Page protection bits handed to the CPU fast path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    pub const RW: Self = Self::READ.union(Self::WRITE);
    pub const RX: Self = Self::READ.union(Self::EXECUTE);
}

/// MMU behavior toggles supplied by the embedder.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmuConfig {
    /// Trace every sized guest read.
    pub log_read: bool,
    /// Trace every sized guest write.
    pub log_write: bool,
}

/// Which memory model to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemModel {
    /// Legacy single-address-space model. Not supported by this runtime.
    Single,
    Multiple,
    Flexible,
}

/// Errors from region map/unmap operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    #[error("address {addr:#x} is not page aligned")]
    Unaligned { addr: VmAddress },

    #[error("range {addr:#x}+{size:#x} wraps the guest address space")]
    RangeOverflow { addr: VmAddress, size: usize },

    #[error("no mapping in range {addr:#x}+{size:#x} of address space {asid}")]
    NotMapped {
        addr: VmAddress,
        size: usize,
        asid: Asid,
    },

    #[error("address space {asid} does not exist")]
    UnknownAddressSpace { asid: Asid },
}

/// A concrete MMU model.
///
/// Required operations cover translation and per-address-space table
/// management; the sized guest I/O contract is provided on top of
/// [`Mmu::get_host_pointer`].
///
/// # Safety contract for `get_host_pointer`
///
/// A non-null pointer must point into an embedder-owned buffer and stay valid
/// for the rest of the page it translates into. The provided sized accessors
/// rely on this to perform unaligned host loads and stores.
pub trait Mmu {
    fn base(&self) -> &MmuBase;
    fn base_mut(&mut self) -> &mut MmuBase;

    fn model(&self) -> MemModel;

    fn current_address_space(&self) -> Asid;
    fn set_current_address_space(&mut self, asid: Asid);

    /// Resolves a guest address to a host pointer, or null when unmapped.
    fn get_host_pointer(&mut self, asid: Asid, addr: VmAddress) -> *mut u8;

    /// Maps `size` bytes of the host buffer at `host` to guest `addr`.
    ///
    /// `addr` must be page aligned; `size` is rounded up to whole pages.
    fn map_region(
        &mut self,
        asid: Asid,
        addr: VmAddress,
        host: *mut u8,
        size: usize,
        perm: Protection,
    ) -> Result<(), RegionError>;

    fn unmap_region(&mut self, asid: Asid, addr: VmAddress, size: usize)
        -> Result<(), RegionError>;

    /// Vends a fresh page table sized by the configured exponent.
    fn create_new_page_table(&mut self) -> PageTableId {
        self.base().create_new_page_table()
    }

    fn read_8(&mut self, addr: VmAddress, data: &mut u8) -> bool {
        let ptr = self.get_host_pointer(CURRENT_ASID, addr);
        if ptr.is_null() {
            return false;
        }
        // SAFETY: non-null pointers from the model are valid for the rest of
        // the page (see trait-level contract), and a 1-byte access never
        // crosses a page.
        *data = unsafe { std::ptr::read_unaligned(ptr) };
        if self.base().config().log_read {
            trace!("read 1 byte from address {addr:#x}");
        }
        true
    }

    fn read_16(&mut self, addr: VmAddress, data: &mut u16) -> bool {
        let ptr = self.get_host_pointer(CURRENT_ASID, addr);
        if ptr.is_null() {
            return false;
        }
        // SAFETY: see trait-level contract. Alignment is the guest CPU's
        // concern; the host access is unaligned-tolerant.
        *data = unsafe { std::ptr::read_unaligned(ptr.cast::<u16>()) };
        if self.base().config().log_read {
            trace!("read 2 bytes from address {addr:#x}");
        }
        true
    }

    fn read_32(&mut self, addr: VmAddress, data: &mut u32) -> bool {
        let ptr = self.get_host_pointer(CURRENT_ASID, addr);
        if ptr.is_null() {
            return false;
        }
        // SAFETY: see trait-level contract.
        *data = unsafe { std::ptr::read_unaligned(ptr.cast::<u32>()) };
        if self.base().config().log_read {
            trace!("read 4 bytes from address {addr:#x}");
        }
        true
    }

    fn read_64(&mut self, addr: VmAddress, data: &mut u64) -> bool {
        let ptr = self.get_host_pointer(CURRENT_ASID, addr);
        if ptr.is_null() {
            return false;
        }
        // SAFETY: see trait-level contract.
        *data = unsafe { std::ptr::read_unaligned(ptr.cast::<u64>()) };
        if self.base().config().log_read {
            trace!("read 8 bytes from address {addr:#x}");
        }
        true
    }

    fn write_8(&mut self, addr: VmAddress, data: u8) -> bool {
        let ptr = self.get_host_pointer(CURRENT_ASID, addr);
        if ptr.is_null() {
            return false;
        }
        // SAFETY: see trait-level contract.
        unsafe { std::ptr::write_unaligned(ptr, data) };
        if self.base().config().log_write {
            trace!("write 1 byte to address {addr:#x}");
        }
        true
    }

    fn write_16(&mut self, addr: VmAddress, data: u16) -> bool {
        let ptr = self.get_host_pointer(CURRENT_ASID, addr);
        if ptr.is_null() {
            return false;
        }
        // SAFETY: see trait-level contract.
        unsafe { std::ptr::write_unaligned(ptr.cast::<u16>(), data) };
        if self.base().config().log_write {
            trace!("write 2 bytes to address {addr:#x}");
        }
        true
    }

    fn write_32(&mut self, addr: VmAddress, data: u32) -> bool {
        let ptr = self.get_host_pointer(CURRENT_ASID, addr);
        if ptr.is_null() {
            return false;
        }
        // SAFETY: see trait-level contract.
        unsafe { std::ptr::write_unaligned(ptr.cast::<u32>(), data) };
        if self.base().config().log_write {
            trace!("write 4 bytes to address {addr:#x}");
        }
        true
    }

    fn write_64(&mut self, addr: VmAddress, data: u64) -> bool {
        let ptr = self.get_host_pointer(CURRENT_ASID, addr);
        if ptr.is_null() {
            return false;
        }
        // SAFETY: see trait-level contract.
        unsafe { std::ptr::write_unaligned(ptr.cast::<u64>(), data) };
        if self.base().config().log_write {
            trace!("write 8 bytes to address {addr:#x}");
        }
        true
    }
}

/// Instantiates the selected memory model and installs its sized I/O hooks
/// into the CPU.
///
/// Returns `None` for a model this runtime does not support.
pub fn make_new_mmu(
    alloc: Rc<RefCell<PageTableAllocator>>,
    cpu: Rc<RefCell<dyn CpuCore>>,
    config: MmuConfig,
    page_size_bits: u32,
    legacy_map: bool,
    model: MemModel,
) -> Option<Rc<RefCell<dyn Mmu>>> {
    let base = MmuBase::new(alloc, cpu.clone(), config, page_size_bits, legacy_map);

    let mmu: Rc<RefCell<dyn Mmu>> = match model {
        MemModel::Multiple => Rc::new(RefCell::new(MultipleMmu::new(base))),
        MemModel::Flexible => Rc::new(RefCell::new(FlexibleMmu::new(base))),
        MemModel::Single => return None,
    };

    cpu.borrow_mut()
        .install_memory_io(Box::new(MmuIoAdapter::new(mmu.clone())));

    Some(mmu)
}
