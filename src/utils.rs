/// Sizes shared by the allocation, stream and heap code.
pub mod memory_constants {
    pub const KB: usize = 1024;
    pub const MB: usize = 1024 * KB;
    pub const GB: usize = 1024 * MB;
    pub const PAGE_SIZE: usize = 4 * KB;
    pub const PAGE_SIZE_64K: usize = 64 * KB;
    pub const CACHE_LINE_SIZE: usize = 64;
    /// Bytes the command streamer may prefetch past the end of a command buffer.
    pub const CS_OVERFETCH_SIZE: usize = PAGE_SIZE;
}

#[must_use]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_up_u64(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(100 + 64 + 4096, memory_constants::PAGE_SIZE_64K), 65536);
    }
}
