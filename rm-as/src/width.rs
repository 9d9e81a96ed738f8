//! Page-table width policy (§4.3.1): choose cappage depths so that
//! data pages land at "round" positions
//! `ADDR_BITS - (PAGESIZE_LOG2 + i · CAPPAGE_SLOTS_LOG2)`.

use rm_proto::{CAPPAGE_SLOTS_LOG2, FOLIO_OBJECTS_LOG2, PAGESIZE_LOG2};

/// Bits the next pivoted-in cappage should consume, given `remaining`
/// untranslated bits at the point of the pivot.
///
/// - `0` bits remaining to translate beyond a page boundary means no
///   new page table is needed at all; the guard absorbs the rest and
///   the terminal slot is a data page (§4.3.1 a).
/// - If what's left fits inside one folio, prefer a folio-width step
///   (§4.3.1 b).
/// - Otherwise shrink so the remainder becomes a multiple of
///   `CAPPAGE_SLOTS_LOG2` above the page boundary (§4.3.1 c), minimizing
///   future small subpages.
pub fn preferred_pt_width(remaining: u32) -> u32 {
    if remaining <= PAGESIZE_LOG2 {
        return 0;
    }
    if remaining <= PAGESIZE_LOG2 + FOLIO_OBJECTS_LOG2 {
        return FOLIO_OBJECTS_LOG2;
    }
    let above_page = remaining - PAGESIZE_LOG2;
    let rem = above_page % CAPPAGE_SLOTS_LOG2;
    if rem == 0 {
        CAPPAGE_SLOTS_LOG2
    } else {
        CAPPAGE_SLOTS_LOG2 - rem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_page_boundary_no_new_table() {
        assert_eq!(preferred_pt_width(PAGESIZE_LOG2), 0);
    }

    #[test]
    fn within_a_folio_prefers_folio_width() {
        assert_eq!(
            preferred_pt_width(PAGESIZE_LOG2 + FOLIO_OBJECTS_LOG2),
            FOLIO_OBJECTS_LOG2
        );
    }

    #[test]
    fn large_remainder_rounds_to_cappage_multiple() {
        let remaining = PAGESIZE_LOG2 + FOLIO_OBJECTS_LOG2 + 3;
        let width = preferred_pt_width(remaining);
        assert_eq!((remaining - width - PAGESIZE_LOG2) % CAPPAGE_SLOTS_LOG2, 0);
    }
}
