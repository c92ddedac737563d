//! AArch64 MMU engine: translation-table construction, mutation and
//! teardown, address-space activation, and the TLB discipline around both.
//!
//! The engine maintains a four-level radix tree that hardware walkers on
//! other CPUs may be traversing concurrently. Writers follow a strict
//! publish order: a child table is zero-filled, a store-store barrier is
//! issued, and only then is the table descriptor written into the parent
//! slot. Unmapping writes the invalid descriptor, invalidates by VA
//! (broadcast, ASID-tagged), and a full DSB terminates every public call.
//!
//! Concurrent writers of the same address space must be serialized by the
//! caller; the engine takes no lock of its own.

use super::mmu_defs::*;
use super::tlb;
use crate::arch::{AspaceFlags, MmuFlags};
use crate::hal::mmio;
use crate::heap;
use crate::lib::error::KernelError;
use crate::mm::physmap::{paddr_to_kvaddr, vaddr_to_paddr};
use crate::mm::{self, pmm, PhysAddr, PAGE_SIZE};
use crate::sync::THREAD_LOCK;

/// The statically allocated kernel top-level translation table. The kernel
/// address space aliases it and never frees it.
#[repr(C, align(4096))]
struct KernelTopTable(core::cell::UnsafeCell<[Pte; MMU_KERNEL_PAGE_TABLE_ENTRIES_TOP]>);

// One writer at a time by the VM layer's serialization; hardware only reads.
unsafe impl Sync for KernelTopTable {}

static KERNEL_TRANSLATION_TABLE: KernelTopTable = KernelTopTable(core::cell::UnsafeCell::new(
    [Pte::INVALID; MMU_KERNEL_PAGE_TABLE_ENTRIES_TOP],
));

pub fn kernel_translation_table() -> *mut Pte {
    KERNEL_TRANSLATION_TABLE.0.get() as *mut Pte
}

/// One hardware address space.
pub struct ArchAspace {
    flags: AspaceFlags,
    base: u64,
    size: u64,
    tt_virt: *mut Pte,
    tt_phys: PhysAddr,
    asid: u16,
    asid_generation: u32,
}

// The translation tree is exclusively owned; cross-CPU access goes through
// the hardware walker, not through this handle.
unsafe impl Send for ArchAspace {}

#[inline]
fn wrap_check(base: u64, size: u64) -> bool {
    base.checked_add(size - 1).is_some()
}

impl ArchAspace {
    /// Initialize an address space covering `[base, base + size)`.
    ///
    /// With [`AspaceFlags::KERNEL`] the window must match the fixed kernel
    /// window and the static kernel top-level table is aliased. Otherwise a
    /// fresh top-level table is allocated and an ASID acquired.
    pub fn new(base: u64, size: u64, flags: AspaceFlags) -> Result<Self, KernelError> {
        if size <= PAGE_SIZE as u64 || !wrap_check(base, size) {
            return Err(KernelError::InvalidArgs);
        }

        if flags.contains(AspaceFlags::KERNEL) {
            if base != KERNEL_ASPACE_BASE || size != KERNEL_ASPACE_SIZE {
                return Err(KernelError::InvalidArgs);
            }
            let tt_virt = kernel_translation_table();
            return Ok(Self {
                flags,
                base,
                size,
                tt_virt,
                tt_phys: vaddr_to_paddr(tt_virt as *const u8),
                asid: crate::mm::asid::GLOBAL_ASID,
                asid_generation: 0,
            });
        }

        let limit = 1u64 << MMU_USER_SIZE_SHIFT;
        if base >= limit || size > limit - base {
            return Err(KernelError::InvalidArgs);
        }

        let table_size = MMU_USER_PAGE_TABLE_ENTRIES_TOP * core::mem::size_of::<Pte>();
        let tt_virt = heap::memalign(table_size, table_size) as *mut Pte;
        if tt_virt.is_null() {
            return Err(KernelError::NoMemory);
        }

        let (asid, asid_generation) = match crate::mm::asid::alloc() {
            Ok(a) => a,
            Err(e) => {
                unsafe { heap::free_aligned(tt_virt as *mut u8, table_size, table_size) };
                return Err(e);
            }
        };

        Ok(Self {
            flags,
            base,
            size,
            tt_virt,
            tt_phys: vaddr_to_paddr(tt_virt as *const u8),
            asid,
            asid_generation,
        })
    }

    /// Tear down a user address space. The caller must already have
    /// unmapped every range; only the top-level table is freed here.
    pub fn destroy(&mut self) -> Result<(), KernelError> {
        assert!(
            !self.flags.contains(AspaceFlags::KERNEL),
            "destroying the kernel address space"
        );
        debug_assert!(!self.tt_virt.is_null());
        if cfg!(debug_assertions) {
            for i in 0..MMU_USER_PAGE_TABLE_ENTRIES_TOP {
                debug_assert!(
                    !unsafe { pte_read(self.tt_virt, i) }.is_valid(),
                    "destroying an address space with live mappings"
                );
            }
        }

        tlb::flush_asid(self.masked_asid());
        mmio::dsb_sy();
        crate::mm::asid::free(self.asid, self.asid_generation);

        let table_size = MMU_USER_PAGE_TABLE_ENTRIES_TOP * core::mem::size_of::<Pte>();
        unsafe { heap::free_aligned(self.tt_virt as *mut u8, table_size, table_size) };
        self.tt_virt = core::ptr::null_mut();
        Ok(())
    }

    #[inline]
    fn is_valid_vaddr(&self, vaddr: u64) -> bool {
        vaddr >= self.base && vaddr <= self.base + (self.size - 1)
    }

    /// The hardware tag actually programmed into TTBR0/TLBI operands.
    #[inline]
    fn masked_asid(&self) -> u16 {
        self.asid & ((1u16 << crate::mm::asid::ASID_BITS) - 1)
    }

    /// Check that `[vaddr, vaddr + size)` stays inside the window.
    fn range_in_window(&self, vaddr: u64, size: u64) -> bool {
        size <= self.size && vaddr - self.base <= self.size - size
    }

    /// Map `count` pages at `vaddr` onto the physical range at `paddr`.
    /// Fails without mutating if a slot in the range is already populated.
    pub fn map(
        &mut self,
        vaddr: u64,
        paddr: u64,
        count: usize,
        flags: MmuFlags,
    ) -> Result<(), KernelError> {
        debug_assert!(!self.tt_virt.is_null());

        if !self.is_valid_vaddr(vaddr) {
            return Err(KernelError::OutOfRange);
        }
        if !mm::is_page_aligned(vaddr) || !mm::is_page_aligned(paddr) {
            return Err(KernelError::InvalidArgs);
        }
        if paddr & !MMU_PTE_OUTPUT_ADDR_MASK != 0 {
            return Err(KernelError::InvalidArgs);
        }
        if count == 0 {
            return Ok(());
        }
        let size = (count as u64)
            .checked_mul(PAGE_SIZE as u64)
            .ok_or(KernelError::InvalidArgs)?;
        if !self.range_in_window(vaddr, size) {
            return Err(KernelError::OutOfRange);
        }

        let attrs = mmu_flags_to_pte_attr(flags)?;

        if self.flags.contains(AspaceFlags::KERNEL) {
            arm64_mmu_map(
                vaddr,
                paddr,
                size,
                attrs,
                KERNEL_ASPACE_BASE,
                MMU_KERNEL_SIZE_SHIFT,
                MMU_KERNEL_TOP_SHIFT,
                MMU_KERNEL_PAGE_SIZE_SHIFT,
                self.tt_virt,
                crate::mm::asid::GLOBAL_ASID,
            )
        } else {
            let asid = self.masked_asid();
            let ret = arm64_mmu_map(
                vaddr,
                paddr,
                size,
                attrs | MMU_PTE_ATTR_NON_GLOBAL,
                0,
                MMU_USER_SIZE_SHIFT,
                MMU_USER_TOP_SHIFT,
                MMU_USER_PAGE_SIZE_SHIFT,
                self.tt_virt,
                asid,
            );
            self.tlb_flush_if_asid_changed(asid);
            ret
        }
    }

    /// Remove any mappings in `count` pages starting at `vaddr`. Slots that
    /// are already invalid are skipped, not an error.
    pub fn unmap(&mut self, vaddr: u64, count: usize) -> Result<(), KernelError> {
        debug_assert!(!self.tt_virt.is_null());

        if !self.is_valid_vaddr(vaddr) {
            return Err(KernelError::OutOfRange);
        }
        if !mm::is_page_aligned(vaddr) {
            return Err(KernelError::InvalidArgs);
        }
        if count == 0 {
            return Ok(());
        }
        let size = (count as u64)
            .checked_mul(PAGE_SIZE as u64)
            .ok_or(KernelError::InvalidArgs)?;
        if !self.range_in_window(vaddr, size) {
            return Err(KernelError::OutOfRange);
        }

        if self.flags.contains(AspaceFlags::KERNEL) {
            arm64_mmu_unmap(
                vaddr,
                size,
                KERNEL_ASPACE_BASE,
                MMU_KERNEL_SIZE_SHIFT,
                MMU_KERNEL_TOP_SHIFT,
                MMU_KERNEL_PAGE_SIZE_SHIFT,
                self.tt_virt,
                crate::mm::asid::GLOBAL_ASID,
            )
        } else {
            let asid = self.masked_asid();
            let ret = arm64_mmu_unmap(
                vaddr,
                size,
                0,
                MMU_USER_SIZE_SHIFT,
                MMU_USER_TOP_SHIFT,
                MMU_USER_PAGE_SIZE_SHIFT,
                self.tt_virt,
                asid,
            );
            self.tlb_flush_if_asid_changed(asid);
            ret
        }
    }

    /// Translate `vaddr`, returning the physical address and the abstract
    /// flags of the mapping.
    pub fn query(&self, vaddr: u64) -> Result<(PhysAddr, MmuFlags), KernelError> {
        debug_assert!(!self.tt_virt.is_null());

        if !self.is_valid_vaddr(vaddr) {
            return Err(KernelError::OutOfRange);
        }

        let (mut index_shift, page_size_shift) = if self.flags.contains(AspaceFlags::KERNEL) {
            (MMU_KERNEL_TOP_SHIFT, MMU_KERNEL_PAGE_SIZE_SHIFT)
        } else {
            (MMU_USER_TOP_SHIFT, MMU_USER_PAGE_SIZE_SHIFT)
        };

        let mut vaddr_rem = vaddr - self.base;
        let mut page_table = self.tt_virt;

        loop {
            let index = (vaddr_rem >> index_shift) as usize;
            vaddr_rem -= (index as u64) << index_shift;
            let pte = unsafe { pte_read(page_table, index) };
            let descriptor = pte.descriptor();

            if descriptor == MMU_PTE_DESCRIPTOR_INVALID {
                return Err(KernelError::NotFound);
            }

            let leaf_descriptor = if index_shift > page_size_shift {
                MMU_PTE_L012_DESCRIPTOR_BLOCK
            } else {
                MMU_PTE_L3_DESCRIPTOR_PAGE
            };
            if descriptor == leaf_descriptor {
                let paddr = pte.output_addr() + vaddr_rem;
                let flags = pte_attr_to_mmu_flags(pte.raw());
                return Ok((paddr, flags));
            }

            if index_shift <= page_size_shift || descriptor != MMU_PTE_L012_DESCRIPTOR_TABLE {
                panic!("corrupt translation descriptor {:#x}", pte.raw());
            }

            page_table = paddr_to_kvaddr(pte.output_addr()) as *mut Pte;
            index_shift -= page_size_shift - 3;
        }
    }

    /// Full-TLB fallback for the ASID recycle race: if the address space's
    /// identifier changed while we were editing tables, any VA invalidates
    /// we issued carried a stale tag.
    fn tlb_flush_if_asid_changed(&self, asid: u16) {
        let state = THREAD_LOCK.lock_irqsave();
        if asid != self.masked_asid() {
            crate::warn!(
                "asid changed while mapping or unmapping, {:#x} -> {:#x}, flushing all tlbs",
                asid,
                self.masked_asid()
            );
            tlb::flush_all_is();
            mmio::dsb_sy();
        }
        THREAD_LOCK.unlock_irqrestore(state);
    }
}

/// Switch the user half of the translation regime. `None` selects the
/// kernel-only configuration (TTBR0 walks disabled).
pub fn context_switch(aspace: Option<&mut ArchAspace>) {
    match aspace {
        Some(aspace) => {
            debug_assert!(!aspace.flags.contains(AspaceFlags::KERNEL));

            let (asid, generation, flush) =
                crate::mm::asid::activate(aspace.asid, aspace.asid_generation);
            aspace.asid = asid;
            aspace.asid_generation = generation;

            let ttbr = ((aspace.masked_asid() as u64) << 48) | aspace.tt_phys;
            write_ttbr0(ttbr);
            write_tcr(MMU_TCR_FLAGS_USER);

            if flush {
                tlb::flush_all_local();
                mmio::dsb_sy();
            }
        }
        None => {
            write_tcr(MMU_TCR_FLAGS_KERNEL);
        }
    }
}

#[inline]
fn write_ttbr0(ttbr: u64) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("msr ttbr0_el1, {}", in(reg) ttbr, options(nostack, preserves_flags));
        core::arch::asm!("isb", options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = ttbr;
}

#[inline]
fn write_tcr(tcr: u64) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("msr tcr_el1, {}", in(reg) tcr, options(nostack, preserves_flags));
        core::arch::asm!("isb", options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = tcr;
}

/// Convert the abstract mapping flags into stage-1 descriptor attributes.
fn mmu_flags_to_pte_attr(flags: MmuFlags) -> Result<u64, KernelError> {
    let mut attr = MMU_PTE_ATTR_AF;

    let cache = flags & MmuFlags::CACHE_MASK;
    if cache == MmuFlags::CACHED {
        attr |= MMU_PTE_ATTR_NORMAL_MEMORY | MMU_PTE_ATTR_SH_INNER_SHAREABLE;
    } else if cache == MmuFlags::UNCACHED {
        attr |= MMU_PTE_ATTR_STRONGLY_ORDERED;
    } else if cache == MmuFlags::UNCACHED_DEVICE {
        attr |= MMU_PTE_ATTR_DEVICE;
    } else {
        debug_assert!(false, "invalid cache flags {:#x}", flags.bits());
        return Err(KernelError::InvalidArgs);
    }

    attr |= match (
        flags.contains(MmuFlags::PERM_USER),
        flags.contains(MmuFlags::PERM_RO),
    ) {
        (false, false) => MMU_PTE_ATTR_AP_P_RW_U_NA,
        (false, true) => MMU_PTE_ATTR_AP_P_RO_U_NA,
        (true, false) => MMU_PTE_ATTR_AP_P_RW_U_RW,
        (true, true) => MMU_PTE_ATTR_AP_P_RO_U_RO,
    };

    if flags.contains(MmuFlags::PERM_NO_EXECUTE) {
        attr |= MMU_PTE_ATTR_UXN | MMU_PTE_ATTR_PXN;
    } else if flags.contains(MmuFlags::PERM_USER) {
        // user executable page, never privileged executable
        attr |= MMU_PTE_ATTR_PXN;
    } else {
        // privileged executable page, never user executable
        attr |= MMU_PTE_ATTR_UXN;
    }

    if flags.contains(MmuFlags::NS) {
        attr |= MMU_PTE_ATTR_NON_SECURE;
    }

    Ok(attr)
}

/// Recover the abstract flags from a leaf descriptor.
fn pte_attr_to_mmu_flags(pte: u64) -> MmuFlags {
    let mut flags = MmuFlags::empty();

    if pte & MMU_PTE_ATTR_NON_SECURE != 0 {
        flags |= MmuFlags::NS;
    }

    match pte & MMU_PTE_ATTR_ATTR_INDEX_MASK {
        MMU_PTE_ATTR_STRONGLY_ORDERED => flags |= MmuFlags::UNCACHED,
        MMU_PTE_ATTR_DEVICE => flags |= MmuFlags::UNCACHED_DEVICE,
        MMU_PTE_ATTR_NORMAL_MEMORY => {}
        _ => panic!("corrupt memory attribute in pte {:#x}", pte),
    }

    match pte & MMU_PTE_ATTR_AP_MASK {
        MMU_PTE_ATTR_AP_P_RW_U_NA => {}
        MMU_PTE_ATTR_AP_P_RW_U_RW => flags |= MmuFlags::PERM_USER,
        MMU_PTE_ATTR_AP_P_RO_U_NA => flags |= MmuFlags::PERM_RO,
        MMU_PTE_ATTR_AP_P_RO_U_RO => flags |= MmuFlags::PERM_USER | MmuFlags::PERM_RO,
        _ => unreachable!(),
    }

    // a page is executable in exactly one privilege mode; the complementary
    // execute-never bit must always be present
    if flags.contains(MmuFlags::PERM_USER) {
        debug_assert!(pte & MMU_PTE_ATTR_PXN != 0);
        if pte & MMU_PTE_ATTR_UXN != 0 {
            flags |= MmuFlags::PERM_NO_EXECUTE;
        }
    } else {
        debug_assert!(pte & MMU_PTE_ATTR_UXN != 0);
        if pte & MMU_PTE_ATTR_PXN != 0 {
            flags |= MmuFlags::PERM_NO_EXECUTE;
        }
    }

    flags
}

#[inline]
unsafe fn pte_read(table: *const Pte, index: usize) -> Pte {
    core::ptr::read_volatile(table.add(index))
}

#[inline]
unsafe fn pte_write(table: *mut Pte, index: usize, pte: Pte) {
    core::ptr::write_volatile(table.add(index), pte)
}

/// Allocate storage for one page-table node: whole frames from the pmm, or
/// an aligned heap allocation for sub-page tables.
fn alloc_page_table(page_size_shift: u32) -> Result<PhysAddr, KernelError> {
    let size = 1usize << page_size_shift;

    if size >= PAGE_SIZE {
        pmm::alloc_contiguous(size / PAGE_SIZE, page_size_shift)
    } else {
        let vaddr = heap::memalign(size, size);
        if vaddr.is_null() {
            return Err(KernelError::NoMemory);
        }
        Ok(vaddr_to_paddr(vaddr))
    }
}

unsafe fn free_page_table(vaddr: *mut Pte, paddr: PhysAddr, page_size_shift: u32) {
    let size = 1usize << page_size_shift;

    if size >= PAGE_SIZE {
        pmm::free_pages(paddr, size / PAGE_SIZE);
    } else {
        heap::free_aligned(vaddr as *mut u8, size, size);
    }
}

/// Fetch the child table behind `table[index]`, allocating and publishing
/// it if the slot is invalid.
unsafe fn get_page_table(
    index: usize,
    page_size_shift: u32,
    table: *mut Pte,
) -> Result<*mut Pte, KernelError> {
    let pte = pte_read(table, index);

    match pte.descriptor() {
        MMU_PTE_DESCRIPTOR_INVALID => {
            let paddr = match alloc_page_table(page_size_shift) {
                Ok(p) => p,
                Err(_) => {
                    crate::warn!("failed to allocate page table");
                    return Err(KernelError::Generic);
                }
            };
            let vaddr = paddr_to_kvaddr(paddr) as *mut Pte;

            core::ptr::write_bytes(vaddr as *mut u8, 0, 1usize << page_size_shift);

            // zero fill must be visible before any CPU can follow the
            // table pointer
            mmio::dmb_ishst();

            pte_write(table, index, Pte::table(paddr));
            Ok(vaddr)
        }
        MMU_PTE_L012_DESCRIPTOR_TABLE => Ok(paddr_to_kvaddr(pte.output_addr()) as *mut Pte),
        MMU_PTE_L012_DESCRIPTOR_BLOCK => Err(KernelError::InvalidArgs),
        _ => panic!("corrupt page table descriptor {:#x}", pte.raw()),
    }
}

unsafe fn page_table_is_clear(table: *const Pte, page_size_shift: u32) -> bool {
    let count = 1usize << (page_size_shift - 3);
    (0..count).all(|i| !pte_read(table, i).is_valid())
}

/// Free every fully empty child table reachable from `table` within the
/// range. A failed map unwinds the leaves it installed level by level; this
/// pass reclaims the intermediate tables that were allocated on the way
/// down, leaving the tree exactly as it was on entry. Tables holding any
/// live entry (pre-existing mappings) are untouched.
unsafe fn prune_empty_tables(
    vaddr_rel_in: u64,
    size_in: u64,
    index_shift: u32,
    page_size_shift: u32,
    table: *mut Pte,
) {
    let mut vaddr_rel = vaddr_rel_in;
    let mut size = size_in;

    while size != 0 {
        let block_size = 1u64 << index_shift;
        let block_mask = block_size - 1;
        let vaddr_rem = vaddr_rel & block_mask;
        let chunk_size = core::cmp::min(size, block_size - vaddr_rem);
        let index = (vaddr_rel >> index_shift) as usize;

        let pte = pte_read(table, index);
        if index_shift > page_size_shift && pte.descriptor() == MMU_PTE_L012_DESCRIPTOR_TABLE {
            let child_paddr = pte.output_addr();
            let child = paddr_to_kvaddr(child_paddr) as *mut Pte;
            prune_empty_tables(
                vaddr_rem,
                chunk_size,
                index_shift - (page_size_shift - 3),
                page_size_shift,
                child,
            );
            if page_table_is_clear(child, page_size_shift) {
                pte_write(table, index, Pte::INVALID);
                mmio::dmb_ishst();
                free_page_table(child, child_paddr, page_size_shift);
            }
        }

        size -= chunk_size;
        if size == 0 {
            break;
        }
        vaddr_rel += chunk_size;
    }
}

/// Unwind the range `[vaddr, vaddr + mapped)` installed by a failing map
/// call at this level, then pass the error through.
unsafe fn unwind_partial_map(
    vaddr: u64,
    vaddr_rel: u64,
    mapped: u64,
    index_shift: u32,
    page_size_shift: u32,
    table: *mut Pte,
    asid: u16,
    err: KernelError,
) -> KernelError {
    arm64_mmu_unmap_pt(
        vaddr,
        vaddr_rel,
        mapped,
        index_shift,
        page_size_shift,
        table,
        asid,
    );
    mmio::dsb_sy();
    err
}

unsafe fn arm64_mmu_map_pt(
    vaddr_in: u64,
    vaddr_rel_in: u64,
    paddr_in: u64,
    size_in: u64,
    attrs: u64,
    index_shift: u32,
    page_size_shift: u32,
    table: *mut Pte,
    asid: u16,
) -> Result<(), KernelError> {
    let mut vaddr = vaddr_in;
    let mut vaddr_rel = vaddr_rel_in;
    let mut paddr = paddr_in;
    let mut size = size_in;

    let granule_mask = (1u64 << page_size_shift) - 1;
    if (vaddr_rel | paddr | size) & granule_mask != 0 {
        return Err(KernelError::InvalidArgs);
    }

    while size != 0 {
        let block_size = 1u64 << index_shift;
        let block_mask = block_size - 1;
        let vaddr_rem = vaddr_rel & block_mask;
        let chunk_size = core::cmp::min(size, block_size - vaddr_rem);
        let index = (vaddr_rel >> index_shift) as usize;

        if (vaddr_rel | paddr) & block_mask != 0
            || chunk_size != block_size
            || index_shift > MMU_PTE_DESCRIPTOR_BLOCK_MAX_SHIFT
        {
            let next_table = match get_page_table(index, page_size_shift, table) {
                Ok(t) => t,
                Err(e) => {
                    return Err(unwind_partial_map(
                        vaddr_in,
                        vaddr_rel_in,
                        size_in - size,
                        index_shift,
                        page_size_shift,
                        table,
                        asid,
                        e,
                    ))
                }
            };
            if let Err(e) = arm64_mmu_map_pt(
                vaddr,
                vaddr_rem,
                paddr,
                chunk_size,
                attrs,
                index_shift - (page_size_shift - 3),
                page_size_shift,
                next_table,
                asid,
            ) {
                return Err(unwind_partial_map(
                    vaddr_in,
                    vaddr_rel_in,
                    size_in - size,
                    index_shift,
                    page_size_shift,
                    table,
                    asid,
                    e,
                ));
            }
        } else {
            let existing = pte_read(table, index);
            if existing.raw() != 0 {
                crate::warn!(
                    "page table entry already in use, index {:#x}, {:#x}",
                    index,
                    existing.raw()
                );
                return Err(unwind_partial_map(
                    vaddr_in,
                    vaddr_rel_in,
                    size_in - size,
                    index_shift,
                    page_size_shift,
                    table,
                    asid,
                    KernelError::InvalidArgs,
                ));
            }

            let pte = if index_shift > page_size_shift {
                Pte::block(paddr, attrs)
            } else {
                Pte::page(paddr, attrs)
            };
            pte_write(table, index, pte);
        }

        size -= chunk_size;
        if size == 0 {
            break;
        }
        // early out above avoids a benign overflow here
        vaddr += chunk_size;
        vaddr_rel += chunk_size;
        paddr += chunk_size;
    }

    Ok(())
}

unsafe fn arm64_mmu_unmap_pt(
    vaddr_in: u64,
    vaddr_rel_in: u64,
    size_in: u64,
    index_shift: u32,
    page_size_shift: u32,
    table: *mut Pte,
    asid: u16,
) {
    let mut vaddr = vaddr_in;
    let mut vaddr_rel = vaddr_rel_in;
    let mut size = size_in;

    while size != 0 {
        let block_size = 1u64 << index_shift;
        let block_mask = block_size - 1;
        let vaddr_rem = vaddr_rel & block_mask;
        let chunk_size = core::cmp::min(size, block_size - vaddr_rem);
        let index = (vaddr_rel >> index_shift) as usize;

        let pte = pte_read(table, index);

        if index_shift > page_size_shift
            && pte.descriptor() == MMU_PTE_L012_DESCRIPTOR_TABLE
        {
            let child_paddr = pte.output_addr();
            let child = paddr_to_kvaddr(child_paddr) as *mut Pte;
            arm64_mmu_unmap_pt(
                vaddr,
                vaddr_rem,
                chunk_size,
                index_shift - (page_size_shift - 3),
                page_size_shift,
                child,
                asid,
            );
            if chunk_size == block_size || page_table_is_clear(child, page_size_shift) {
                pte_write(table, index, Pte::INVALID);
                mmio::dmb_ishst();
                free_page_table(child, child_paddr, page_size_shift);
            }
        } else if pte.raw() != 0 {
            pte_write(table, index, Pte::INVALID);
            core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
            if asid == crate::mm::asid::GLOBAL_ASID {
                tlb::flush_vaddr_global(vaddr);
            } else {
                tlb::flush_vaddr_asid(vaddr, asid);
            }
        }

        size -= chunk_size;
        if size == 0 {
            break;
        }
        // early out above avoids a benign overflow here
        vaddr += chunk_size;
        vaddr_rel += chunk_size;
    }
}

#[allow(clippy::too_many_arguments)]
fn arm64_mmu_map(
    vaddr: u64,
    paddr: u64,
    size: u64,
    attrs: u64,
    vaddr_base: u64,
    top_size_shift: u32,
    top_index_shift: u32,
    page_size_shift: u32,
    top_page_table: *mut Pte,
    asid: u16,
) -> Result<(), KernelError> {
    let vaddr_rel = vaddr.wrapping_sub(vaddr_base);
    let vaddr_rel_max = 1u64 << top_size_shift;

    if size > vaddr_rel_max || vaddr_rel > vaddr_rel_max - size {
        return Err(KernelError::InvalidArgs);
    }
    if top_page_table.is_null() {
        return Err(KernelError::InvalidArgs);
    }

    let ret = unsafe {
        arm64_mmu_map_pt(
            vaddr,
            vaddr_rel,
            paddr,
            size,
            attrs,
            top_index_shift,
            page_size_shift,
            top_page_table,
            asid,
        )
    };
    if ret.is_err() {
        // the leaves installed by this call are already unwound; reclaim
        // the intermediate tables allocated on the way down
        unsafe {
            prune_empty_tables(vaddr_rel, size, top_index_shift, page_size_shift, top_page_table);
        }
    }
    mmio::dsb_sy();
    ret
}

#[allow(clippy::too_many_arguments)]
fn arm64_mmu_unmap(
    vaddr: u64,
    size: u64,
    vaddr_base: u64,
    top_size_shift: u32,
    top_index_shift: u32,
    page_size_shift: u32,
    top_page_table: *mut Pte,
    asid: u16,
) -> Result<(), KernelError> {
    let vaddr_rel = vaddr.wrapping_sub(vaddr_base);
    let vaddr_rel_max = 1u64 << top_size_shift;

    if size > vaddr_rel_max || vaddr_rel > vaddr_rel_max - size {
        return Err(KernelError::InvalidArgs);
    }
    if top_page_table.is_null() {
        return Err(KernelError::InvalidArgs);
    }

    unsafe {
        arm64_mmu_unmap_pt(
            vaddr,
            vaddr_rel,
            size,
            top_index_shift,
            page_size_shift,
            top_page_table,
            asid,
        );
    }
    mmio::dsb_sy();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmm::test_support as pmm_test;

    const PAGE: u64 = PAGE_SIZE as u64;
    const USER_WINDOW: u64 = 1u64 << MMU_USER_SIZE_SHIFT;

    fn user_aspace() -> ArchAspace {
        ArchAspace::new(0, USER_WINDOW, AspaceFlags::empty()).unwrap()
    }

    #[test]
    fn map_query_round_trip() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        aspace
            .map(0x1000, 0xAAAA000, 2, MmuFlags::CACHED | MmuFlags::PERM_RO)
            .unwrap();

        assert_eq!(
            aspace.query(0x1000).unwrap(),
            (0xAAAA000, MmuFlags::CACHED | MmuFlags::PERM_RO)
        );
        assert_eq!(
            aspace.query(0x2000).unwrap(),
            (0xAAAA000 + 0x1000, MmuFlags::CACHED | MmuFlags::PERM_RO)
        );
        assert_eq!(aspace.query(0x3000), Err(KernelError::NotFound));

        aspace.unmap(0x1000, 2).unwrap();
        aspace.destroy().unwrap();
    }

    #[test]
    fn query_within_a_page_keeps_offset() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        aspace.map(0x8000, 0x555000, 1, MmuFlags::CACHED).unwrap();
        let (paddr, _) = aspace.query(0x8abc).unwrap();
        assert_eq!(paddr, 0x555abc);

        aspace.unmap(0x8000, 1).unwrap();
        aspace.destroy().unwrap();
    }

    #[test]
    fn block_mapping_installs_no_leaf_tables() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        let before = pmm::pages_in_use();

        // one naturally aligned 2 MiB chunk: a single block descriptor at
        // the 2 MiB level, so only the two intermediate tables appear
        let block = 1u64 << 21;
        aspace
            .map(block, 0x4000_0000, (block / PAGE) as usize, MmuFlags::CACHED)
            .unwrap();
        assert_eq!(pmm::pages_in_use(), before + 2);

        // interior addresses resolve through the block descriptor
        let (paddr, _) = aspace.query(block + 0x12345 * 0x10).unwrap();
        assert_eq!(paddr, 0x4000_0000 + 0x12345 * 0x10);

        aspace.unmap(block, (block / PAGE) as usize).unwrap();
        assert_eq!(pmm::pages_in_use(), before);
        aspace.destroy().unwrap();
    }

    #[test]
    fn misaligned_paddr_is_refused_without_mutation() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        let before = pmm::pages_in_use();

        assert_eq!(
            aspace.map(0x1000, 0x1, 1, MmuFlags::CACHED),
            Err(KernelError::InvalidArgs)
        );
        assert_eq!(pmm::pages_in_use(), before);
        assert_eq!(aspace.query(0x1000), Err(KernelError::NotFound));

        aspace.destroy().unwrap();
    }

    #[test]
    fn misaligned_vaddr_is_refused() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        assert_eq!(
            aspace.map(0x1008, 0x2000, 1, MmuFlags::CACHED),
            Err(KernelError::InvalidArgs)
        );
        aspace.destroy().unwrap();
    }

    #[test]
    fn unmap_of_unmapped_range_is_a_noop() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        let before = pmm::pages_in_use();
        aspace.unmap(0x1000, 1).unwrap();
        assert_eq!(pmm::pages_in_use(), before);
        aspace.destroy().unwrap();
    }

    #[test]
    fn out_of_window_and_wrapping_ranges_are_refused() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace =
            ArchAspace::new(0, 1u64 << 30, AspaceFlags::empty()).unwrap();
        let before = pmm::pages_in_use();

        // start beyond the window
        assert_eq!(
            aspace.map(1u64 << 30, 0x1000, 1, MmuFlags::CACHED),
            Err(KernelError::OutOfRange)
        );
        // end walks off the window
        assert_eq!(
            aspace.map((1u64 << 30) - PAGE, 0x1000, 2, MmuFlags::CACHED),
            Err(KernelError::OutOfRange)
        );
        assert_eq!(
            aspace.unmap((1u64 << 30) - PAGE, 2),
            Err(KernelError::OutOfRange)
        );
        // count large enough to overflow the size computation
        assert_eq!(
            aspace.map(0, 0x1000, usize::MAX, MmuFlags::CACHED),
            Err(KernelError::InvalidArgs)
        );

        assert_eq!(pmm::pages_in_use(), before);
        aspace.destroy().unwrap();
    }

    #[test]
    fn map_unmap_leaves_no_frames_behind() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        let before = pmm::pages_in_use();

        aspace.map(0x10000, 0x800000, 8, MmuFlags::CACHED).unwrap();
        assert!(pmm::pages_in_use() > before);
        aspace.unmap(0x10000, 8).unwrap();
        assert_eq!(pmm::pages_in_use(), before);

        aspace.destroy().unwrap();
    }

    #[test]
    fn failed_map_restores_pre_state_for_every_injection_point() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        // [0x1ff000, 0x201000) crosses a 2 MiB boundary: the walk allocates
        // two intermediate tables plus two leaf tables
        let vaddr = 0x1ff000u64;
        let count = 2usize;

        let mut aspace = user_aspace();
        let before = pmm::pages_in_use();

        for k in 0..4 {
            pmm_test::fail_after(k);
            assert_eq!(
                aspace.map(vaddr, 0xA00000, count, MmuFlags::CACHED),
                Err(KernelError::Generic),
                "injection at allocation {}",
                k
            );
            pmm_test::clear_failure();

            assert_eq!(pmm::pages_in_use(), before, "leak after injection {}", k);
            for page in 0..count as u64 {
                assert_eq!(
                    aspace.query(vaddr + page * PAGE),
                    Err(KernelError::NotFound),
                    "mapping survived injection {}",
                    k
                );
            }
        }

        // the same map succeeds once allocations stop failing
        aspace.map(vaddr, 0xA00000, count, MmuFlags::CACHED).unwrap();
        assert_eq!(aspace.query(0x200000).unwrap().0, 0xA01000);
        aspace.unmap(vaddr, count).unwrap();
        assert_eq!(pmm::pages_in_use(), before);
        aspace.destroy().unwrap();
    }

    #[test]
    fn populated_slot_rejects_remap_and_unwinds_new_work() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        aspace.map(0x5000, 0x111000, 1, MmuFlags::CACHED).unwrap();
        let frames = pmm::pages_in_use();

        // second page of the new range collides with the existing mapping
        assert_eq!(
            aspace.map(0x4000, 0x222000, 2, MmuFlags::CACHED),
            Err(KernelError::InvalidArgs)
        );

        // the colliding call's own work was unwound, the old mapping stays
        assert_eq!(aspace.query(0x4000), Err(KernelError::NotFound));
        assert_eq!(aspace.query(0x5000).unwrap().0, 0x111000);
        assert_eq!(pmm::pages_in_use(), frames);

        aspace.unmap(0x5000, 1).unwrap();
        aspace.destroy().unwrap();
    }

    #[test]
    fn unmap_invalidates_each_leaf_by_asid() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        aspace.map(0x7000, 0x900000, 3, MmuFlags::CACHED).unwrap();

        tlb::stats::reset();
        aspace.unmap(0x7000, 3).unwrap();
        assert_eq!(
            tlb::stats::VA_ASID.load(core::sync::atomic::Ordering::Relaxed),
            3
        );
        assert_eq!(
            tlb::stats::VA_GLOBAL.load(core::sync::atomic::Ordering::Relaxed),
            0
        );

        aspace.destroy().unwrap();
    }

    #[test]
    fn kernel_aspace_uses_global_invalidation() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = ArchAspace::new(
            KERNEL_ASPACE_BASE,
            KERNEL_ASPACE_SIZE,
            AspaceFlags::KERNEL,
        )
        .unwrap();
        assert_eq!(aspace.tt_virt, kernel_translation_table());

        let vaddr = KERNEL_ASPACE_BASE + 0x40000000;
        aspace.map(vaddr, 0xC00000, 1, MmuFlags::CACHED).unwrap();
        assert_eq!(aspace.query(vaddr).unwrap().0, 0xC00000);

        tlb::stats::reset();
        aspace.unmap(vaddr, 1).unwrap();
        assert_eq!(
            tlb::stats::VA_GLOBAL.load(core::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(
            tlb::stats::VA_ASID.load(core::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn kernel_aspace_window_must_match() {
        assert!(ArchAspace::new(0, KERNEL_ASPACE_SIZE, AspaceFlags::KERNEL).is_err());
        assert!(ArchAspace::new(
            KERNEL_ASPACE_BASE,
            KERNEL_ASPACE_SIZE / 2,
            AspaceFlags::KERNEL
        )
        .is_err());
    }

    #[test]
    fn flag_translation_canonicalizes_permissions() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();

        let flags = MmuFlags::UNCACHED_DEVICE
            | MmuFlags::PERM_USER
            | MmuFlags::PERM_NO_EXECUTE
            | MmuFlags::NS;
        aspace.map(0xA000, 0xD00000, 1, flags).unwrap();
        assert_eq!(aspace.query(0xA000).unwrap().1, flags);

        aspace
            .map(0xB000, 0xD01000, 1, MmuFlags::CACHED | MmuFlags::PERM_USER)
            .unwrap();
        assert_eq!(
            aspace.query(0xB000).unwrap().1,
            MmuFlags::CACHED | MmuFlags::PERM_USER
        );

        aspace.unmap(0xA000, 1).unwrap();
        aspace.unmap(0xB000, 1).unwrap();
        aspace.destroy().unwrap();
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "invalid cache flags"))]
    fn contradictory_cache_flags_assert() {
        // asserts in debug builds; release builds report the error instead
        let flags = MmuFlags::UNCACHED | MmuFlags::UNCACHED_DEVICE;
        assert_eq!(mmu_flags_to_pte_attr(flags), Err(KernelError::InvalidArgs));
    }

    #[test]
    fn asid_recycle_fallback_flushes_everything() {
        let _guard = pmm_test::PMM_TEST_LOCK.lock();
        pmm_test::reset(128);

        let mut aspace = user_aspace();
        aspace.map(0x3000, 0x700000, 1, MmuFlags::CACHED).unwrap();

        // simulate the VM layer recycling the identifier mid-operation
        let stale = aspace.masked_asid();
        aspace.asid = stale.wrapping_add(1);

        tlb::stats::reset();
        aspace.tlb_flush_if_asid_changed(stale);
        assert!(tlb::stats::ALL.load(core::sync::atomic::Ordering::Relaxed) >= 1);

        aspace.asid = stale;
        aspace.unmap(0x3000, 1).unwrap();
        aspace.destroy().unwrap();
    }
}
