use serde::{Deserialize, Serialize};

/// A half-open byte interval `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    pub fn new(offset: u64, length: u64) -> Range {
        Range { offset, length }
    }

    pub fn end(&self) -> u64 {
        // Descriptors and partial-file sizes are bounded by realistic blob sizes, well
        // under u64, so this never saturates in practice; this still avoids panicking on
        // adversarial input.
        self.offset.saturating_add(self.length)
    }

    fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// A sorted, non-overlapping, non-adjacent set of ranges. The empty-after-merge invariant
/// is maintained by every constructor in this module; nothing outside `range.rs` builds a
/// `Vec<Range>` directly.
pub type RangeSet = Vec<Range>;

/// Returns the unique minimal sorted set equivalent to the union of `rs`, joining ranges
/// that touch or overlap.
pub fn merge(rs: &[Range]) -> RangeSet {
    let mut sorted: Vec<Range> = rs.iter().copied().filter(|r| !r.is_empty()).collect();
    sorted.sort_by_key(|r| r.offset);

    let mut out: RangeSet = Vec::with_capacity(sorted.len());
    for r in sorted {
        match out.last_mut() {
            Some(last) if r.offset <= last.end() => {
                let new_end = last.end().max(r.end());
                last.length = new_end - last.offset;
            }
            _ => out.push(r),
        }
    }
    out
}

/// `merge(rs ∪ {r})`.
pub fn add(rs: &[Range], r: Range) -> RangeSet {
    if r.is_empty() {
        return merge(rs);
    }
    let mut combined: Vec<Range> = rs.to_vec();
    combined.push(r);
    merge(&combined)
}

/// The complement of `rs` within `[0, total)`.
pub fn find_gaps(rs: &[Range], total: u64) -> RangeSet {
    find_gaps_in(rs, 0, total)
}

/// The complement of `rs`, clipped to `[off, off + len)`.
pub fn find_gaps_in(rs: &[Range], off: u64, len: u64) -> RangeSet {
    if len == 0 {
        return Vec::new();
    }
    let window_end = off.saturating_add(len);
    let merged = merge(rs);

    let mut gaps = Vec::new();
    let mut cursor = off;
    for r in &merged {
        if r.end() <= cursor {
            continue;
        }
        if r.offset >= window_end {
            break;
        }
        let clipped_start = r.offset.max(cursor);
        if clipped_start > cursor {
            gaps.push(Range::new(cursor, clipped_start - cursor));
        }
        cursor = r.end().max(cursor);
    }
    if cursor < window_end {
        gaps.push(Range::new(cursor, window_end - cursor));
    }
    gaps
}

/// Sum of lengths after merging.
pub fn coverage(rs: &[Range]) -> u64 {
    merge(rs).iter().map(|r| r.length).sum()
}

/// `coverage(rs) == total ∧ find_gaps(rs, total) == ∅`.
pub fn is_complete(rs: &[Range], total: u64) -> bool {
    if total == 0 {
        return true;
    }
    find_gaps(rs, total).is_empty() && coverage(rs) == total
}

/// Whether some merged range wholly covers `[off, off + len)`.
pub fn contains(rs: &[Range], off: u64, len: u64) -> bool {
    if len == 0 {
        return true;
    }
    let end = off.saturating_add(len);
    merge(rs)
        .iter()
        .any(|r| r.offset <= off && r.end() >= end)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_sorts_and_joins_adjacent() {
        let rs = vec![Range::new(10, 5), Range::new(0, 5), Range::new(5, 5)];
        assert_eq!(merge(&rs), vec![Range::new(0, 15)]);
    }

    #[test]
    fn merge_keeps_gaps_apart() {
        let rs = vec![Range::new(0, 5), Range::new(10, 5)];
        assert_eq!(merge(&rs), vec![Range::new(0, 5), Range::new(10, 5)]);
    }

    #[test]
    fn merge_drops_empty_ranges() {
        let rs = vec![Range::new(5, 0), Range::new(0, 5)];
        assert_eq!(merge(&rs), vec![Range::new(0, 5)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let rs = vec![Range::new(0, 5), Range::new(3, 10), Range::new(20, 1)];
        let once = merge(&rs);
        let twice = merge(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn add_extends_existing_range() {
        let rs = vec![Range::new(0, 5)];
        assert_eq!(add(&rs, Range::new(5, 5)), vec![Range::new(0, 10)]);
    }

    #[test]
    fn add_overlapping_merges() {
        let rs = vec![Range::new(0, 10), Range::new(20, 10)];
        assert_eq!(
            add(&rs, Range::new(5, 20)),
            vec![Range::new(0, 30)]
        );
    }

    #[test]
    fn find_gaps_full_coverage_is_empty() {
        let rs = vec![Range::new(0, 10)];
        assert!(find_gaps(&rs, 10).is_empty());
    }

    #[test]
    fn find_gaps_reports_missing_middle() {
        let rs = vec![Range::new(0, 5), Range::new(8, 2)];
        assert_eq!(find_gaps(&rs, 10), vec![Range::new(5, 3)]);
    }

    #[test]
    fn find_gaps_reports_missing_tail() {
        let rs = vec![Range::new(0, 5)];
        assert_eq!(find_gaps(&rs, 10), vec![Range::new(5, 5)]);
    }

    #[test]
    fn find_gaps_in_clips_to_window() {
        let rs: Vec<Range> = vec![];
        assert_eq!(find_gaps_in(&rs, 10, 5), vec![Range::new(10, 5)]);
    }

    #[test]
    fn find_gaps_in_empty_len_is_empty() {
        let rs: Vec<Range> = vec![];
        assert!(find_gaps_in(&rs, 10, 0).is_empty());
    }

    #[test]
    fn coverage_sums_merged_lengths() {
        let rs = vec![Range::new(0, 5), Range::new(3, 5), Range::new(100, 1)];
        assert_eq!(coverage(&rs), 8 + 1);
    }

    #[test]
    fn is_complete_matches_find_gaps() {
        let rs = vec![Range::new(0, 10)];
        assert!(is_complete(&rs, 10));
        assert!(!is_complete(&rs, 11));
    }

    #[test]
    fn contains_requires_whole_range_covered() {
        let rs = vec![Range::new(0, 10)];
        assert!(contains(&rs, 2, 5));
        assert!(!contains(&rs, 8, 5));
    }

    #[test]
    fn contains_zero_length_is_trivially_true() {
        let rs: Vec<Range> = vec![];
        assert!(contains(&rs, 5, 0));
    }

    // Randomized check that `merge` + `find_gaps` always agree with a naive bitmap model.
    #[test]
    fn randomized_against_bitmap_model() {
        const TOTAL: usize = 500;
        for seed in 0..20u64 {
            let rng = fastrand::Rng::with_seed(seed);
            let mut bitmap = vec![false; TOTAL];
            let mut rs: RangeSet = Vec::new();
            for _ in 0..30 {
                let offset = rng.usize(0..TOTAL);
                let length = rng.usize(0..(TOTAL - offset).max(1));
                for b in bitmap.iter_mut().skip(offset).take(length) {
                    *b = true;
                }
                rs = add(&rs, Range::new(offset as u64, length as u64));
            }
            let expected_coverage = bitmap.iter().filter(|b| **b).count() as u64;
            assert_eq!(coverage(&rs), expected_coverage);
            assert_eq!(is_complete(&rs, TOTAL as u64), bitmap.iter().all(|b| *b));

            for r in find_gaps(&rs, TOTAL as u64) {
                for i in r.offset..r.end() {
                    assert!(!bitmap[i as usize], "gap at {i} should be uncovered");
                }
            }
        }
    }
}
