//! Day-aligned partitioning of a historical time span.

use chrono::{DateTime, NaiveTime, Utc};
use core_types::TimeRange;

/// Split `[range.start, range.end)` into contiguous sub-ranges, each ending
/// on the next UTC midnight or on the overall end, whichever comes first.
/// The union of the result equals the input exactly, with no overlaps.
pub fn partition_days(range: TimeRange) -> Vec<TimeRange> {
    let mut ranges = Vec::new();
    let mut cursor = range.start;
    while cursor < range.end {
        let end = day_boundary(cursor, range.end);
        ranges.push(TimeRange { start: cursor, end });
        cursor = end;
    }
    ranges
}

fn day_boundary(ts: DateTime<Utc>, overall_end: DateTime<Utc>) -> DateTime<Utc> {
    match ts.date_naive().succ_opt() {
        Some(next_day) => next_day.and_time(NaiveTime::MIN).and_utc().min(overall_end),
        None => overall_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn ts(rfc: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc).unwrap().with_timezone(&Utc)
    }

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(ts(start), ts(end)).unwrap()
    }

    #[test]
    fn splits_two_and_a_half_days_into_three_ranges() {
        let ranges = partition_days(range("2023-11-01T00:00:00Z", "2023-11-03T12:00:00Z"));
        assert_eq!(
            ranges,
            vec![
                range("2023-11-01T00:00:00Z", "2023-11-02T00:00:00Z"),
                range("2023-11-02T00:00:00Z", "2023-11-03T00:00:00Z"),
                range("2023-11-03T00:00:00Z", "2023-11-03T12:00:00Z"),
            ]
        );
    }

    #[test]
    fn mid_day_start_is_bounded_by_the_next_midnight() {
        let ranges = partition_days(range("2023-11-01T18:30:00Z", "2023-11-02T06:00:00Z"));
        assert_eq!(
            ranges,
            vec![
                range("2023-11-01T18:30:00Z", "2023-11-02T00:00:00Z"),
                range("2023-11-02T00:00:00Z", "2023-11-02T06:00:00Z"),
            ]
        );
    }

    #[test]
    fn union_is_exact_and_contiguous() {
        let input = range("2023-10-30T07:11:00Z", "2023-11-04T23:59:00Z");
        let ranges = partition_days(input);
        assert_eq!(ranges.first().unwrap().start, input.start);
        assert_eq!(ranges.last().unwrap().end, input.end);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[0].end);
        }
    }

    #[test]
    fn sub_day_span_yields_a_single_range() {
        let input = range("2023-11-01T03:00:00Z", "2023-11-01T04:00:00Z");
        assert_eq!(partition_days(input), vec![input]);
    }

    #[test]
    fn empty_span_yields_no_ranges() {
        let input = range("2023-11-01T00:00:00Z", "2023-11-01T00:00:00Z");
        assert!(partition_days(input).is_empty());
    }
}
