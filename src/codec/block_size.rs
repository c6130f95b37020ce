//! Chunked block layout: pick the smallest power-of-two block size,
//! starting at a configured minimum, that keeps the block count under a
//! threshold; coalesce a too-short trailing block into its predecessor.
//!
//! The constants are exposed as named configuration here rather than baked
//! in, with historical defaults as `Default`.

/// Named, overridable constants for the block-size schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizeConfig {
    pub min_block_size: u64,
    pub max_block_size: u64,
    /// Doubling stops once `file_len / block_size` would drop below this.
    pub max_block_count: u64,
    /// A trailing block shorter than `block_size / avoid_divisor` is
    /// merged into its predecessor instead of standing alone.
    pub avoid_divisor: u64,
}

impl Default for ChunkSizeConfig {
    fn default() -> Self {
        Self {
            min_block_size: 4 * 1024,
            max_block_size: 16 * 1024 * 1024,
            max_block_count: 4096,
            avoid_divisor: 5,
        }
    }
}

/// Result of [`choose_block_schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSchedule {
    pub num_blocks: u64,
    pub block_size: u64,
    pub last_block_size: u64,
}

/// Choose `(num_blocks, block_size, last_block_size)` for a file of length
/// `file_len`: block size is the smallest `min_block_size * 2^k` (capped
/// at `max_block_size`) that keeps the block count under
/// `max_block_count`; a short trailing block is folded into the one
/// before it.
pub fn choose_block_schedule(file_len: u64, config: &ChunkSizeConfig) -> BlockSchedule {
    if file_len == 0 {
        return BlockSchedule {
            num_blocks: 0,
            block_size: config.min_block_size,
            last_block_size: 0,
        };
    }

    let mut block_size = config.min_block_size.max(1);
    while file_len / block_size > config.max_block_count && block_size * 2 <= config.max_block_size {
        block_size *= 2;
    }

    let mut num_blocks = (file_len + block_size - 1) / block_size;
    let mut last_block_size = file_len - (num_blocks - 1) * block_size;

    if num_blocks > 1 && last_block_size < block_size / config.avoid_divisor.max(1) {
        num_blocks -= 1;
        last_block_size += block_size;
    }

    BlockSchedule {
        num_blocks,
        block_size,
        last_block_size,
    }
}

/// The clear (plaintext) size of block `index` (0-based) under `schedule`.
pub fn block_len(schedule: &BlockSchedule, index: u64) -> u64 {
    if index + 1 == schedule.num_blocks {
        schedule.last_block_size
    } else {
        schedule.block_size
    }
}

/// Byte offset of block `index` (0-based) under `schedule`.
pub fn block_offset(schedule: &BlockSchedule, index: u64) -> u64 {
    index * schedule.block_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_file_single_block() {
        let cfg = ChunkSizeConfig::default();
        let sched = choose_block_schedule(1000, &cfg);
        assert_eq!(sched.num_blocks, 1);
        assert_eq!(sched.last_block_size, 1000);
    }

    #[test]
    fn exact_multiple_has_no_short_tail() {
        let cfg = ChunkSizeConfig::default();
        let sched = choose_block_schedule(cfg.min_block_size * 4, &cfg);
        assert_eq!(sched.num_blocks, 4);
        assert_eq!(sched.last_block_size, cfg.min_block_size);
    }

    #[test]
    fn doubling_kicks_in_for_large_files() {
        let cfg = ChunkSizeConfig::default();
        let file_len = cfg.min_block_size * cfg.max_block_count * 3;
        let sched = choose_block_schedule(file_len, &cfg);
        assert!(sched.block_size > cfg.min_block_size);
        assert!(file_len / sched.block_size <= cfg.max_block_count);
    }

    #[test]
    fn short_tail_is_merged() {
        let cfg = ChunkSizeConfig::default();
        let file_len = cfg.min_block_size * 3 + cfg.min_block_size / (cfg.avoid_divisor * 2);
        let sched = choose_block_schedule(file_len, &cfg);
        assert_eq!(sched.num_blocks, 3);
        let sum: u64 = (0..sched.num_blocks).map(|i| block_len(&sched, i)).sum();
        assert_eq!(sum, file_len);
    }

    #[test]
    fn block_lens_always_sum_to_file_len() {
        let cfg = ChunkSizeConfig::default();
        for file_len in [1u64, 17, 4095, 4096, 4097, 9_000_000] {
            let sched = choose_block_schedule(file_len, &cfg);
            let sum: u64 = (0..sched.num_blocks).map(|i| block_len(&sched, i)).sum();
            assert_eq!(sum, file_len, "file_len={}", file_len);
        }
    }
}
