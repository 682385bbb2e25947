use crate::record::PanoramaRecord;
use serde::Serialize;

/// What to do with a dated record whose month is outside 1..=12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidMonth {
    /// Keep the record as year-only.
    #[default]
    Clear,
    /// Drop the record.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterOptions {
    pub require_year: bool,
    pub invalid_month: InvalidMonth,
    /// Keep only records captured in this year.
    pub only_year: Option<i32>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            require_year: true,
            invalid_month: InvalidMonth::Clear,
            only_year: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoYear,
    /// A month cannot anchor a capture without its year.
    MonthWithoutYear,
    InvalidMonth,
    OtherYear,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub input: usize,
    pub kept: usize,
    pub kept_year_month: usize,
    pub kept_year_only: usize,
    pub kept_undated: usize,
    pub dropped_no_year: usize,
    pub dropped_month_without_year: usize,
    pub dropped_invalid_month: usize,
    pub cleared_invalid_month: usize,
    pub dropped_other_year: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: Vec<PanoramaRecord>,
    pub dropped: Vec<(PanoramaRecord, DropReason)>,
    pub stats: FilterStats,
}

/// Date-anchoring predicate.
///
/// A record is kept when it has a year, or when `require_year` is false and
/// it carries no date at all. Month-without-year is never kept.
#[inline]
pub fn keep(record: &PanoramaRecord, require_year: bool) -> bool {
    match (record.capture_year, record.capture_month) {
        (Some(_), _) => true,
        (None, Some(_)) => false,
        (None, None) => !require_year,
    }
}

fn classify(record: &PanoramaRecord, opts: &FilterOptions) -> Result<Option<u32>, DropReason> {
    if !keep(record, opts.require_year) {
        return Err(if record.capture_month.is_some() {
            DropReason::MonthWithoutYear
        } else {
            DropReason::NoYear
        });
    }

    if let Some(year) = opts.only_year {
        if record.capture_year != Some(year) {
            return Err(DropReason::OtherYear);
        }
    }

    match record.capture_month {
        Some(m) if !(1..=12).contains(&m) => match opts.invalid_month {
            InvalidMonth::Clear => Ok(None),
            InvalidMonth::Drop => Err(DropReason::InvalidMonth),
        },
        month => Ok(month),
    }
}

/// Splits `records` into kept and dropped sets. Pure and order-preserving.
pub fn filter<I>(records: I, opts: &FilterOptions) -> FilterOutcome
where
    I: IntoIterator<Item = PanoramaRecord>,
{
    let mut out = FilterOutcome::default();

    for mut record in records {
        out.stats.input += 1;
        match classify(&record, opts) {
            Ok(month) => {
                if month != record.capture_month {
                    out.stats.cleared_invalid_month += 1;
                    record.capture_month = month;
                }
                match (record.capture_year, record.capture_month) {
                    (Some(_), Some(_)) => out.stats.kept_year_month += 1,
                    (Some(_), None) => out.stats.kept_year_only += 1,
                    _ => out.stats.kept_undated += 1,
                }
                out.stats.kept += 1;
                out.kept.push(record);
            }
            Err(reason) => {
                match reason {
                    DropReason::NoYear => out.stats.dropped_no_year += 1,
                    DropReason::MonthWithoutYear => out.stats.dropped_month_without_year += 1,
                    DropReason::InvalidMonth => out.stats.dropped_invalid_month += 1,
                    DropReason::OtherYear => out.stats.dropped_other_year += 1,
                }
                out.dropped.push((record, reason));
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, year: Option<i32>, month: Option<u32>) -> PanoramaRecord {
        PanoramaRecord::new(id, 1.0, 2.0).with_date(year, month)
    }

    fn all_shapes() -> Vec<PanoramaRecord> {
        vec![
            rec("ym", Some(2021), Some(6)),
            rec("y", Some(2019), None),
            rec("m", None, Some(6)),
            rec("none", None, None),
            rec("bad_month", Some(2020), Some(13)),
        ]
    }

    #[test]
    fn require_year_keeps_exactly_the_dated_records() {
        for r in all_shapes() {
            assert_eq!(keep(&r, true), r.capture_year.is_some(), "record {}", r.id);
        }
    }

    #[test]
    fn month_without_year_is_dropped_under_both_policies() {
        let r = rec("m", None, Some(6));
        assert!(!keep(&r, true));
        assert!(!keep(&r, false));

        let out = filter(vec![r], &FilterOptions::default());
        assert!(out.kept.is_empty());
        assert_eq!(out.dropped[0].1, DropReason::MonthWithoutYear);
    }

    #[test]
    fn undated_records_survive_when_year_is_optional() {
        let opts = FilterOptions {
            require_year: false,
            ..FilterOptions::default()
        };
        let out = filter(all_shapes(), &opts);
        let ids: Vec<_> = out.kept.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["ym", "y", "none", "bad_month"]);
        assert_eq!(out.stats.kept_undated, 1);
        assert_eq!(out.stats.dropped_month_without_year, 1);
    }

    #[test]
    fn invalid_month_is_cleared_or_dropped() {
        let out = filter(all_shapes(), &FilterOptions::default());
        let cleared = out.kept.iter().find(|r| r.id == "bad_month").unwrap();
        assert_eq!(cleared.capture_month, None);
        assert_eq!(out.stats.cleared_invalid_month, 1);
        assert_eq!(out.stats.kept, 3);
        assert_eq!(out.stats.kept_year_month, 1);
        assert_eq!(out.stats.kept_year_only, 2);

        let opts = FilterOptions {
            invalid_month: InvalidMonth::Drop,
            ..FilterOptions::default()
        };
        let out = filter(all_shapes(), &opts);
        assert!(out.kept.iter().all(|r| r.id != "bad_month"));
        assert_eq!(out.stats.dropped_invalid_month, 1);
    }

    #[test]
    fn only_year_selects_a_single_capture_year() {
        let opts = FilterOptions {
            only_year: Some(2021),
            ..FilterOptions::default()
        };
        let out = filter(all_shapes(), &opts);
        assert_eq!(out.kept.len(), 1);
        assert_eq!(out.kept[0].id, "ym");
        assert_eq!(out.stats.dropped_other_year, 2);
    }

    #[test]
    fn filtering_is_deterministic() {
        let a = filter(all_shapes(), &FilterOptions::default());
        let b = filter(all_shapes(), &FilterOptions::default());
        assert_eq!(a.kept, b.kept);
        assert_eq!(a.stats, b.stats);
    }
}
