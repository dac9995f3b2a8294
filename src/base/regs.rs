/// Trait for the 32-bit register blocks a controller is programmed through.
///
/// Offsets are byte offsets from the start of the block. Implementations use interior
/// mutability: the same block is touched from CPU threads and from the interrupt handler.
pub trait RegisterBus: Send + Sync {
    fn read32_impl(&self, offset: usize) -> u32;
    fn read32(&self, offset: usize) -> u32 {
        // driver code itself must maintain these invariants
        assert!(offset & 0x3 == 0, "unaligned register read @ {:#x}", offset);
        self.read32_impl(offset)
    }

    fn write32_impl(&self, offset: usize, value: u32);
    fn write32(&self, offset: usize, value: u32) {
        assert!(offset & 0x3 == 0, "unaligned register write @ {:#x}", offset);
        self.write32_impl(offset, value)
    }
}
