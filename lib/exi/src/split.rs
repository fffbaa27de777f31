//! Transfer splitting around the DMA alignment.
//!
//! ```text
//! |_______________|______...______|_______________| DMA alignment
//!     <-- pre --><----- dma -----><-- post -->
//!     +----------+------...------+-----------+
//!     | non-DMA  | DMA           | non-DMA   |
//!     +----------+------...------+-----------+
//!      < 32 bytes  N*32 bytes      < 32 bytes
//! ```
//!
//! When no aligned block fits, the head of the buffer is bounced through
//! a per-channel 32-byte scratch buffer if at least 32 bytes are involved.

use crate::DMA_ALIGN;

/// How a transfer of `len` bytes starting at some address is carried out.
///
/// The three regions are contiguous and in buffer order:
/// `[0, pre)`, `[pre, pre + dma)`, `[pre + dma, len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlan {
    /// Leading bytes moved in immediate mode before the DMA starts
    pub pre: usize,
    /// Bytes moved by DMA
    pub dma: usize,
    /// Trailing bytes moved in immediate mode after the DMA completes
    pub post: usize,
    /// The DMA region goes through the channel scratch buffer
    pub bounce: bool,
}

impl SplitPlan {
    /// Total bytes covered by the plan
    pub fn total(&self) -> usize {
        self.pre + self.dma + self.post
    }
}

const fn align_next(addr: usize) -> usize {
    (addr + DMA_ALIGN - 1) & !(DMA_ALIGN - 1)
}

const fn align_prev(addr: usize) -> usize {
    addr & !(DMA_ALIGN - 1)
}

/// Plans a DMA-capable transfer of `len` bytes at address `addr`.
///
/// Returns `None` when the whole transfer has to run in immediate mode.
pub fn plan(addr: usize, len: usize) -> Option<SplitPlan> {
    if len < DMA_ALIGN {
        return None;
    }

    let end = addr + len;
    let dma_start = align_next(addr);
    let dma_end = align_prev(end).max(dma_start);

    let pre = dma_start - addr;
    let dma = dma_end - dma_start;
    let post = end - dma_end;

    if dma > 0 {
        return Some(SplitPlan {
            pre,
            dma,
            post,
            bounce: false,
        });
    }

    // At most 31 + 31 bytes here.
    if pre + post >= DMA_ALIGN {
        Some(SplitPlan {
            pre: 0,
            dma: DMA_ALIGN,
            post: pre + post - DMA_ALIGN,
            bounce: true,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x8000_1000;

    #[test]
    fn test_short_transfers_stay_immediate() {
        assert_eq!(plan(BASE, 0), None);
        assert_eq!(plan(BASE + 3, 31), None);
    }

    #[test]
    fn test_aligned_transfer() {
        let p = plan(BASE, 96).expect("dma");
        assert_eq!((p.pre, p.dma, p.post, p.bounce), (0, 96, 0, false));
    }

    #[test]
    fn test_seventy_bytes_five_past_boundary() {
        let p = plan(BASE + 5, 70).expect("dma");
        assert_eq!((p.pre, p.dma, p.post), (27, 32, 11));
        assert!(!p.bounce);
        assert_eq!(p.total(), 70);
    }

    #[test]
    fn test_unaligned_short_block_bounces() {
        // 27 leading + 13 trailing, no aligned block in between
        let p = plan(BASE + 5, 40).expect("bounce");
        assert_eq!((p.pre, p.dma, p.post, p.bounce), (0, 32, 8, true));

        let p = plan(BASE + 20, 32).expect("bounce");
        assert_eq!((p.pre, p.dma, p.post, p.bounce), (0, 32, 0, true));
    }

    #[test]
    fn test_plans_cover_every_byte() {
        for offset in 0..DMA_ALIGN {
            for len in DMA_ALIGN..200 {
                if let Some(p) = plan(BASE + offset, len) {
                    assert_eq!(p.total(), len, "offset {} len {}", offset, len);
                    assert_eq!(p.dma % DMA_ALIGN, 0);
                    assert!(p.pre < DMA_ALIGN && p.post < DMA_ALIGN);
                    if !p.bounce {
                        assert_eq!((BASE + offset + p.pre) % DMA_ALIGN, 0);
                    }
                }
            }
        }
    }
}
