//! Platform descriptors: MMIO bases and per-board facts the arch core
//! needs. QEMU virt is the default board.

/// UART descriptor.
#[derive(Copy, Clone)]
pub struct UartDesc {
    pub base: usize,
    pub clock_hz: u32,
}

/// GICv3 descriptor: distributor base plus the first redistributor frame.
#[derive(Copy, Clone)]
pub struct GicDesc {
    pub gicd: usize,
    pub gicr: usize,
}

pub struct PlatformDesc {
    pub uart: UartDesc,
    pub gic: GicDesc,
    pub ram_base: u64,
    pub ram_size: usize,
}

/// QEMU virt machine defaults.
static QEMU_VIRT: PlatformDesc = PlatformDesc {
    uart: UartDesc {
        base: 0x0900_0000,
        clock_hz: 24_000_000,
    },
    gic: GicDesc {
        gicd: 0x0800_0000,
        gicr: 0x080A_0000,
    },
    ram_base: 0x4000_0000,
    ram_size: 0x2000_0000,
};

pub fn active() -> &'static PlatformDesc {
    &QEMU_VIRT
}
