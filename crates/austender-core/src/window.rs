//! Splits a fetch range into bounded windows and sizes the worker pool.

use chrono::{DateTime, Duration, Utc};

/// Fetch/caching/partitioning unit: a half-open date sub-interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Upper bound on window length, aligned with month-grained cache skips.
pub const MAX_WINDOW_DAYS: i64 = 31;

/// Split `[start, end]` into contiguous, non-overlapping windows of at
/// most `window_days` days whose union covers the full range. Degenerate
/// inputs (`end <= start`) come back as a single unchanged window.
pub fn split_date_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window_days: i64,
) -> Vec<DateWindow> {
    let window_days = if window_days <= 0 {
        MAX_WINDOW_DAYS
    } else {
        window_days
    };
    if end <= start {
        return vec![DateWindow { start, end }];
    }

    let mut windows = Vec::new();
    let mut current = start;
    while current < end {
        let next = (current + Duration::days(window_days)).min(end);
        windows.push(DateWindow {
            start: current,
            end: next,
        });
        if next <= current {
            break;
        }
        current = next;
    }
    if windows.is_empty() {
        windows.push(DateWindow { start, end });
    }
    windows
}

/// Worker pool size for windowed fetching: all cores but one, floor 1.
pub fn default_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn splits_range_into_bounded_windows() {
        let windows = split_date_windows(utc(2024, 1, 1), utc(2024, 3, 3), 31);
        assert_eq!(
            windows,
            vec![
                DateWindow {
                    start: utc(2024, 1, 1),
                    end: utc(2024, 2, 1),
                },
                DateWindow {
                    start: utc(2024, 2, 1),
                    end: utc(2024, 3, 3),
                },
            ]
        );
    }

    #[test]
    fn windows_cover_range_without_gaps() {
        let start = utc(2020, 3, 15);
        let end = utc(2021, 11, 2);
        let windows = split_date_windows(start, end, 31);
        assert_eq!(windows.first().unwrap().start, start);
        assert_eq!(windows.last().unwrap().end, end);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        for w in &windows {
            assert!(w.end - w.start <= Duration::days(31));
            assert!(w.end > w.start);
        }
    }

    #[test]
    fn degenerate_inputs_yield_single_window() {
        let a = utc(2024, 5, 1);
        let b = utc(2024, 4, 1);
        assert_eq!(
            split_date_windows(a, a, 31),
            vec![DateWindow { start: a, end: a }]
        );
        assert_eq!(
            split_date_windows(a, b, 31),
            vec![DateWindow { start: a, end: b }]
        );
    }

    #[test]
    fn concurrency_floor_is_one() {
        assert!(default_concurrency() >= 1);
    }
}
