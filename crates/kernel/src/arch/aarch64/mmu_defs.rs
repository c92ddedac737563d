//! AArch64 translation-table formats and MMU register values.
//!
//! 4 KiB granule, four translation levels, 48-bit kernel and user windows.
//! The constants mirror the VMSAv8-64 descriptor layout; everything here is
//! plain bit math and compiles on any target.

/// Place `val` (masked to `count` bits) at bit `base`.
const fn bm(base: u64, count: u64, val: u64) -> u64 {
    (val & ((1u64 << count) - 1)) << base
}

pub const MMU_KERNEL_SIZE_SHIFT: u32 = 48;
pub const MMU_USER_SIZE_SHIFT: u32 = 48;

pub const MMU_KERNEL_PAGE_SIZE_SHIFT: u32 = 12;
pub const MMU_USER_PAGE_SIZE_SHIFT: u32 = 12;

/// Index shift of the top translation level (bits 47:39 with a 4 KiB
/// granule).
pub const MMU_KERNEL_TOP_SHIFT: u32 = 39;
pub const MMU_USER_TOP_SHIFT: u32 = 39;

pub const MMU_KERNEL_PAGE_TABLE_ENTRIES_TOP: usize =
    1 << (MMU_KERNEL_SIZE_SHIFT - MMU_KERNEL_TOP_SHIFT);
pub const MMU_USER_PAGE_TABLE_ENTRIES_TOP: usize =
    1 << (MMU_USER_SIZE_SHIFT - MMU_USER_TOP_SHIFT);

/// The fixed kernel window: the upper 48-bit half of the address space.
pub const KERNEL_ASPACE_BASE: u64 = !0u64 << MMU_KERNEL_SIZE_SHIFT;
pub const KERNEL_ASPACE_SIZE: u64 = 1u64 << MMU_KERNEL_SIZE_SHIFT;

/// Largest level allowed to hold a block descriptor (1 GiB).
pub const MMU_PTE_DESCRIPTOR_BLOCK_MAX_SHIFT: u32 = 30;

// Descriptor type field, bits [1:0].
pub const MMU_PTE_DESCRIPTOR_INVALID: u64 = bm(0, 2, 0);
pub const MMU_PTE_DESCRIPTOR_MASK: u64 = bm(0, 2, 3);
pub const MMU_PTE_L012_DESCRIPTOR_BLOCK: u64 = bm(0, 2, 1);
pub const MMU_PTE_L012_DESCRIPTOR_TABLE: u64 = bm(0, 2, 3);
pub const MMU_PTE_L3_DESCRIPTOR_PAGE: u64 = bm(0, 2, 3);

// Output address field, bits [47:12].
pub const MMU_PTE_OUTPUT_ADDR_MASK: u64 = bm(12, 36, 0xf_ffff_ffff);

// Lower attributes.
pub const MMU_PTE_ATTR_ATTR_INDEX_MASK: u64 = bm(2, 3, 7);
pub const MMU_PTE_ATTR_STRONGLY_ORDERED: u64 = bm(2, 3, 0);
pub const MMU_PTE_ATTR_DEVICE: u64 = bm(2, 3, 1);
pub const MMU_PTE_ATTR_NORMAL_MEMORY: u64 = bm(2, 3, 2);

pub const MMU_PTE_ATTR_NON_SECURE: u64 = 1 << 5;

pub const MMU_PTE_ATTR_AP_MASK: u64 = bm(6, 2, 3);
pub const MMU_PTE_ATTR_AP_P_RW_U_NA: u64 = bm(6, 2, 0);
pub const MMU_PTE_ATTR_AP_P_RW_U_RW: u64 = bm(6, 2, 1);
pub const MMU_PTE_ATTR_AP_P_RO_U_NA: u64 = bm(6, 2, 2);
pub const MMU_PTE_ATTR_AP_P_RO_U_RO: u64 = bm(6, 2, 3);

pub const MMU_PTE_ATTR_SH_NON_SHAREABLE: u64 = bm(8, 2, 0);
pub const MMU_PTE_ATTR_SH_OUTER_SHAREABLE: u64 = bm(8, 2, 2);
pub const MMU_PTE_ATTR_SH_INNER_SHAREABLE: u64 = bm(8, 2, 3);

pub const MMU_PTE_ATTR_AF: u64 = 1 << 10;
pub const MMU_PTE_ATTR_NON_GLOBAL: u64 = 1 << 11;

// Upper attributes.
pub const MMU_PTE_ATTR_PXN: u64 = 1 << 53;
pub const MMU_PTE_ATTR_UXN: u64 = 1 << 54;

// MAIR indices backing the three memory types above.
pub const MMU_MAIR_VAL: u64 = bm(0, 8, 0x00)  // index 0: Device-nGnRnE
    | bm(8, 8, 0x04)                          // index 1: Device-nGnRE
    | bm(16, 8, 0xff);                        // index 2: Normal WBWA

// TCR_EL1 fields.
const fn tcr_ips(v: u64) -> u64 {
    bm(32, 3, v)
}
const fn tcr_tg1(v: u64) -> u64 {
    bm(30, 2, v)
}
const fn tcr_sh1(v: u64) -> u64 {
    bm(28, 2, v)
}
const fn tcr_orgn1(v: u64) -> u64 {
    bm(26, 2, v)
}
const fn tcr_irgn1(v: u64) -> u64 {
    bm(24, 2, v)
}
const fn tcr_t1sz(v: u64) -> u64 {
    bm(16, 6, v)
}
const fn tcr_tg0(v: u64) -> u64 {
    bm(14, 2, v)
}
const fn tcr_sh0(v: u64) -> u64 {
    bm(12, 2, v)
}
const fn tcr_orgn0(v: u64) -> u64 {
    bm(10, 2, v)
}
const fn tcr_irgn0(v: u64) -> u64 {
    bm(8, 2, v)
}
const fn tcr_t0sz(v: u64) -> u64 {
    bm(0, 6, v)
}

const MMU_TCR_EPD0: u64 = bm(7, 1, 1);

/// Shared TTBR1 (kernel half) configuration: 48-bit VA, 4 KiB granule,
/// inner-shareable write-back walks, 48-bit IPA.
const MMU_TCR_FLAGS_BASE: u64 = tcr_ips(0b101)
    | tcr_tg1(0b10)
    | tcr_sh1(3)
    | tcr_orgn1(1)
    | tcr_irgn1(1)
    | tcr_t1sz(64 - MMU_KERNEL_SIZE_SHIFT as u64);

/// Kernel-only configuration: TTBR0 walks disabled.
pub const MMU_TCR_FLAGS_KERNEL: u64 = MMU_TCR_FLAGS_BASE | MMU_TCR_EPD0;

/// User configuration: TTBR0 enabled with the same walk attributes.
pub const MMU_TCR_FLAGS_USER: u64 = MMU_TCR_FLAGS_BASE
    | tcr_tg0(0b00)
    | tcr_sh0(3)
    | tcr_orgn0(1)
    | tcr_irgn0(1)
    | tcr_t0sz(64 - MMU_USER_SIZE_SHIFT as u64);

/// One translation-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const INVALID: Pte = Pte(MMU_PTE_DESCRIPTOR_INVALID);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Descriptor type bits [1:0].
    pub const fn descriptor(self) -> u64 {
        self.0 & MMU_PTE_DESCRIPTOR_MASK
    }

    pub const fn is_valid(self) -> bool {
        self.descriptor() != MMU_PTE_DESCRIPTOR_INVALID
    }

    pub const fn output_addr(self) -> u64 {
        self.0 & MMU_PTE_OUTPUT_ADDR_MASK
    }

    /// Table descriptor pointing at a child table.
    pub const fn table(paddr: u64) -> Self {
        Self(paddr | MMU_PTE_L012_DESCRIPTOR_TABLE)
    }

    /// Block descriptor at a non-leaf level.
    pub const fn block(paddr: u64, attrs: u64) -> Self {
        Self(paddr | attrs | MMU_PTE_L012_DESCRIPTOR_BLOCK)
    }

    /// Page descriptor at the leaf level.
    pub const fn page(paddr: u64, attrs: u64) -> Self {
        Self(paddr | attrs | MMU_PTE_L3_DESCRIPTOR_PAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_dispatch() {
        assert!(!Pte::INVALID.is_valid());
        let t = Pte::table(0x4000_0000);
        assert_eq!(t.descriptor(), MMU_PTE_L012_DESCRIPTOR_TABLE);
        assert_eq!(t.output_addr(), 0x4000_0000);
        let b = Pte::block(0x4020_0000, MMU_PTE_ATTR_AF);
        assert_eq!(b.descriptor(), MMU_PTE_L012_DESCRIPTOR_BLOCK);
    }

    #[test]
    fn top_level_covers_full_window() {
        assert_eq!(MMU_KERNEL_PAGE_TABLE_ENTRIES_TOP, 512);
        assert_eq!(MMU_USER_PAGE_TABLE_ENTRIES_TOP, 512);
        assert_eq!(KERNEL_ASPACE_BASE, 0xffff_0000_0000_0000);
    }

    #[test]
    fn ap_encodings_are_distinct() {
        let aps = [
            MMU_PTE_ATTR_AP_P_RW_U_NA,
            MMU_PTE_ATTR_AP_P_RW_U_RW,
            MMU_PTE_ATTR_AP_P_RO_U_NA,
            MMU_PTE_ATTR_AP_P_RO_U_RO,
        ];
        for (i, a) in aps.iter().enumerate() {
            assert_eq!(a & !MMU_PTE_ATTR_AP_MASK, 0);
            for b in &aps[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
