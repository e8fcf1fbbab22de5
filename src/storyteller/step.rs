//! Step alignment math.
//!
//! Steps are 1-based, contiguous blocks of `step_size` chapters.
//! All functions panic on non-positive arguments; callers validate
//! configuration before reaching this module.

/// Start index of the step containing `chapter_idx`.
pub fn step_start_for_chapter(chapter_idx: i64, step_size: i64) -> i64 {
    assert!(step_size > 0, "step_size must be positive");
    assert!(chapter_idx > 0, "chapter_idx must be positive");
    ((chapter_idx - 1) / step_size) * step_size + 1
}

/// Inclusive end index of a step, clamped to the last chapter.
pub fn step_end_for_start(step_start: i64, step_size: i64, max_chapter_idx: i64) -> i64 {
    assert!(step_size > 0, "step_size must be positive");
    assert!(step_start > 0, "step_start must be positive");
    assert!(max_chapter_idx > 0, "max_chapter_idx must be positive");
    (step_start + step_size - 1).min(max_chapter_idx)
}

/// Align a user-provided lower bound down to its step start.
pub fn align_from_chapter(from_chapter: i64, step_size: i64) -> i64 {
    step_start_for_chapter(from_chapter, step_size)
}

/// Align a user-provided upper bound up to its step end, clamped.
pub fn align_to_chapter(to_chapter: i64, step_size: i64, max_chapter_idx: i64) -> i64 {
    let start = step_start_for_chapter(to_chapter, step_size);
    step_end_for_start(start, step_size, max_chapter_idx)
}

/// Inclusive `(start, end)` step ranges covering an interval.
pub fn iter_step_ranges(start_chapter: i64, end_chapter: i64, step_size: i64) -> Vec<(i64, i64)> {
    assert!(step_size > 0, "step_size must be positive");
    assert!(
        start_chapter > 0 && end_chapter > 0,
        "chapter idx must be positive"
    );
    if start_chapter > end_chapter {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    let mut current = start_chapter;
    while current <= end_chapter {
        let step_start = step_start_for_chapter(current, step_size);
        let step_end = (step_start + step_size - 1).min(end_chapter);
        if ranges.last() != Some(&(step_start, step_end)) {
            ranges.push((step_start, step_end));
        }
        current = step_end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_start_math() {
        assert_eq!(step_start_for_chapter(1, 5), 1);
        assert_eq!(step_start_for_chapter(5, 5), 1);
        assert_eq!(step_start_for_chapter(6, 5), 6);
        assert_eq!(step_start_for_chapter(7, 5), 6);
    }

    #[test]
    fn step_end_clamps_to_max() {
        assert_eq!(step_end_for_start(1, 5, 12), 5);
        assert_eq!(step_end_for_start(11, 5, 12), 12);
    }

    #[test]
    fn alignment_directions() {
        assert_eq!(align_from_chapter(7, 5), 6);
        assert_eq!(align_to_chapter(7, 5, 40), 10);
        assert_eq!(align_to_chapter(38, 5, 40), 40);
    }

    #[test]
    fn ranges_cover_the_interval() {
        assert_eq!(iter_step_ranges(1, 12, 5), vec![(1, 5), (6, 10), (11, 12)]);
        assert_eq!(iter_step_ranges(6, 6, 5), vec![(6, 6)]);
        assert!(iter_step_ranges(9, 3, 5).is_empty());
    }

    #[test]
    #[should_panic(expected = "step_size must be positive")]
    fn zero_step_size_panics() {
        step_start_for_chapter(1, 0);
    }

    #[test]
    #[should_panic(expected = "chapter_idx must be positive")]
    fn zero_chapter_panics() {
        step_start_for_chapter(0, 5);
    }
}
