// AArch64 architecture support.
//
// The translation-table engine and frame constructors are plain memory
// code and build on every target (their unit tests run hosted); only the
// instruction-level leaves are gated.

pub mod arch;
pub mod fpu;
pub mod gicv3;
pub mod mmu;
pub mod mmu_defs;
pub mod ops;
pub mod serial;
pub mod thread;
pub mod tlb;
