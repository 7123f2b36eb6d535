//! Size Classifier (spec.md §4.1): maps a requested byte count to a class
//! index and back. Table-driven and branch-free where the policy's class
//! set permits it; this module is on every `alloc`/`free` hot path.
//!
//! Two families live here because P2FL/MCK2 share one nine-class table
//! (spec.md §3 "Size classes") while BUD/LZBUD share a separate
//! power-of-two-of-the-page table (spec.md Glossary "MINBUFSIZE").

use crate::config::{MINBUFSIZE, PAGESIZE};

/// The eight fixed power-of-two classes shared by P2FL and MCK2; the
/// ninth class is `MAXSPACE`, which is policy-specific (it depends on
/// that policy's page-header and buffer-header sizes) and is therefore
/// passed in by the caller rather than baked into this table.
pub const P2_FIXED_CLASS_SIZES: [usize; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

pub const P2_NUM_CLASSES: usize = P2_FIXED_CLASS_SIZES.len() + 1;

/// Classifies `size` into one of the nine P2FL/MCK2 classes. `maxspace`
/// is the ninth class's size (policy-specific). Returns `None` if `size`
/// does not fit even the largest class.
#[inline]
pub fn p2_class_of(size: usize, maxspace: usize) -> Option<usize> {
    if size > maxspace {
        return None;
    }
    for (index, &class_size) in P2_FIXED_CLASS_SIZES.iter().enumerate() {
        if size <= class_size {
            return Some(index);
        }
    }
    Some(P2_FIXED_CLASS_SIZES.len())
}

/// Inverse of [`p2_class_of`]: the exact byte count reserved for `index`.
#[inline]
pub fn p2_class_size(index: usize, maxspace: usize) -> usize {
    *P2_FIXED_CLASS_SIZES.get(index).unwrap_or(&maxspace)
}

/// Number of BUD/LZBUD size classes: `log2(PAGESIZE / MINBUFSIZE)`.
pub const BUD_NUM_CLASSES: usize = {
    let pagesize_log2 = PAGESIZE.trailing_zeros();
    let minbuf_log2 = MINBUFSIZE.trailing_zeros();
    (pagesize_log2 - minbuf_log2) as usize
};

/// Class `index` (`0..BUD_NUM_CLASSES`) denotes size `PAGESIZE /
/// 2^(index+1)` (spec.md §3: class 0 is the largest class, a half page;
/// the last class is `MINBUFSIZE`).
#[inline]
pub const fn bud_class_size(index: usize) -> usize {
    PAGESIZE >> (index + 1)
}

/// Rounds `size` up to the next power of two no smaller than
/// `MINBUFSIZE`, then returns its class index. Returns `None` if the
/// rounded size would exceed a half page (the largest BUD/LZBUD class).
#[inline]
pub fn bud_class_of(size: usize) -> Option<usize> {
    let rounded = size.max(MINBUFSIZE).next_power_of_two();
    if rounded > PAGESIZE / 2 {
        return None;
    }
    let pagesize_log2 = PAGESIZE.trailing_zeros();
    let rounded_log2 = rounded.trailing_zeros();
    Some((pagesize_log2 - 1 - rounded_log2) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2_classes_round_consistently() {
        for size in [1usize, 31, 32, 33, 500, 4096, 4097] {
            let maxspace = 8000;
            if size > maxspace {
                continue;
            }
            let idx = p2_class_of(size, maxspace).unwrap();
            let class_size = p2_class_size(idx, maxspace);
            assert!(class_size >= size);
            // Re-running the same size must land on the same class.
            assert_eq!(p2_class_of(size, maxspace), Some(idx));
        }
    }

    #[test]
    fn bud_classes_cover_minbuf_to_half_page() {
        assert_eq!(bud_class_size(0), PAGESIZE / 2);
        assert_eq!(bud_class_size(BUD_NUM_CLASSES - 1), MINBUFSIZE);
        assert_eq!(bud_class_of(1), Some(BUD_NUM_CLASSES - 1));
        assert_eq!(bud_class_of(MINBUFSIZE), Some(BUD_NUM_CLASSES - 1));
        assert_eq!(bud_class_of(PAGESIZE / 2), Some(0));
        assert_eq!(bud_class_of(PAGESIZE / 2 + 1), None);
    }

    #[test]
    fn bud_class_of_rounds_up_to_power_of_two() {
        assert_eq!(bud_class_of(33), bud_class_of(64));
        assert_eq!(bud_class_size(bud_class_of(40).unwrap()), 64);
    }
}
