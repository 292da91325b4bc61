//! Relative and absolute time expressions resolved against a reference instant.

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::PipelineError;
use crate::models::{TimeGranularity, TimeRange};

static LAST_N: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:最近|过去|近|last|past)\s*(\d+)\s*(天|日|周|个月|月|days?|weeks?|months?)")
        .expect("valid regex")
});

static DATE_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(\d{4}-\d{1,2}-\d{1,2})\s*(?:到|至|~|-|to|and|until)\s*(\d{4}-\d{1,2}-\d{1,2})",
    )
    .expect("valid regex")
});

static SINGLE_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{1,2}-\d{1,2}").expect("valid regex"));

#[derive(Debug, Clone, Copy)]
enum Relative {
    Today,
    Yesterday,
    DayBeforeYesterday,
    ThisWeek,
    LastWeek,
    LastSevenDays,
    ThisMonth,
    LastMonth,
    LastThirtyDays,
    ThisYear,
    LastYear,
}

const PHRASES: &[(&str, Relative)] = &[
    ("今天", Relative::Today),
    ("今日", Relative::Today),
    ("today", Relative::Today),
    ("昨天", Relative::Yesterday),
    ("昨日", Relative::Yesterday),
    ("yesterday", Relative::Yesterday),
    ("前天", Relative::DayBeforeYesterday),
    ("本周", Relative::ThisWeek),
    ("这周", Relative::ThisWeek),
    ("this week", Relative::ThisWeek),
    ("上周", Relative::LastWeek),
    ("上个星期", Relative::LastWeek),
    ("last week", Relative::LastWeek),
    ("最近一周", Relative::LastSevenDays),
    ("过去一周", Relative::LastSevenDays),
    ("近一周", Relative::LastSevenDays),
    ("本月", Relative::ThisMonth),
    ("这个月", Relative::ThisMonth),
    ("this month", Relative::ThisMonth),
    ("上个月", Relative::LastMonth),
    ("上月", Relative::LastMonth),
    ("last month", Relative::LastMonth),
    ("最近一个月", Relative::LastThirtyDays),
    ("过去一个月", Relative::LastThirtyDays),
    ("近一个月", Relative::LastThirtyDays),
    ("今年", Relative::ThisYear),
    ("this year", Relative::ThisYear),
    ("去年", Relative::LastYear),
    ("last year", Relative::LastYear),
];

/// A resolved range and the byte span of the phrase it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTime {
    pub range: TimeRange,
    pub span: (usize, usize),
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

fn out_of_range(expr: &str) -> PipelineError {
    PipelineError::Analysis(format!("Time expression '{}' is out of range", expr))
}

fn shift_days(date: NaiveDate, days: i64, expr: &str) -> Result<NaiveDate, PipelineError> {
    let shifted = if days >= 0 {
        date.checked_add_days(Days::new(days as u64))
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
    };
    shifted.ok_or_else(|| out_of_range(expr))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn days_range(
    start: NaiveDate,
    end: NaiveDate,
    granularity: TimeGranularity,
    expr: &str,
) -> TimeRange {
    TimeRange {
        start: midnight(start),
        end: midnight(end),
        granularity,
        relative: Some(expr.to_string()),
    }
}

fn resolve_relative(
    relative: Relative,
    today: NaiveDate,
    expr: &str,
) -> Result<TimeRange, PipelineError> {
    let tomorrow = shift_days(today, 1, expr)?;
    let monday = shift_days(today, -(today.weekday().num_days_from_monday() as i64), expr)?;
    let month_start = first_of_month(today);
    let year_start = NaiveDate::from_ymd_opt(today.year(), 1, 1).ok_or_else(|| out_of_range(expr))?;

    let range = match relative {
        Relative::Today => days_range(today, tomorrow, TimeGranularity::Day, expr),
        Relative::Yesterday => {
            days_range(shift_days(today, -1, expr)?, today, TimeGranularity::Day, expr)
        }
        Relative::DayBeforeYesterday => days_range(
            shift_days(today, -2, expr)?,
            shift_days(today, -1, expr)?,
            TimeGranularity::Day,
            expr,
        ),
        Relative::ThisWeek => days_range(
            monday,
            shift_days(monday, 7, expr)?,
            TimeGranularity::Week,
            expr,
        ),
        Relative::LastWeek => days_range(
            shift_days(monday, -7, expr)?,
            monday,
            TimeGranularity::Week,
            expr,
        ),
        Relative::LastSevenDays => days_range(
            shift_days(today, -6, expr)?,
            tomorrow,
            TimeGranularity::Day,
            expr,
        ),
        Relative::ThisMonth => days_range(
            month_start,
            month_start
                .checked_add_months(Months::new(1))
                .ok_or_else(|| out_of_range(expr))?,
            TimeGranularity::Month,
            expr,
        ),
        Relative::LastMonth => days_range(
            month_start
                .checked_sub_months(Months::new(1))
                .ok_or_else(|| out_of_range(expr))?,
            month_start,
            TimeGranularity::Month,
            expr,
        ),
        Relative::LastThirtyDays => days_range(
            shift_days(today, -29, expr)?,
            tomorrow,
            TimeGranularity::Day,
            expr,
        ),
        Relative::ThisYear => days_range(
            year_start,
            year_start
                .checked_add_months(Months::new(12))
                .ok_or_else(|| out_of_range(expr))?,
            TimeGranularity::Year,
            expr,
        ),
        Relative::LastYear => days_range(
            year_start
                .checked_sub_months(Months::new(12))
                .ok_or_else(|| out_of_range(expr))?,
            year_start,
            TimeGranularity::Year,
            expr,
        ),
    };
    Ok(range)
}

fn parse_date(s: &str) -> Result<NaiveDate, PipelineError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| PipelineError::Analysis(format!("Invalid date '{}'", s)))
}

/// Resolve the last-N window, e.g. 最近7天 → [today-6, tomorrow)
fn resolve_last_n(
    n: u64,
    unit: &str,
    today: NaiveDate,
    expr: &str,
) -> Result<TimeRange, PipelineError> {
    if n == 0 {
        return Err(PipelineError::Analysis(format!(
            "Time expression '{}' covers no time",
            expr
        )));
    }
    let tomorrow = shift_days(today, 1, expr)?;
    let n = i64::try_from(n).map_err(|_| out_of_range(expr))?;
    let range = if unit.starts_with('周') || unit.starts_with("week") {
        let days = n.checked_mul(7).ok_or_else(|| out_of_range(expr))?;
        days_range(shift_days(today, 1 - days, expr)?, tomorrow, TimeGranularity::Day, expr)
    } else if unit.contains('月') || unit.starts_with("month") {
        let months = u32::try_from(n).map_err(|_| out_of_range(expr))?;
        let start = shift_days(today, 1, expr)?
            .checked_sub_months(Months::new(months))
            .ok_or_else(|| out_of_range(expr))?;
        let granularity = if months > 1 {
            TimeGranularity::Month
        } else {
            TimeGranularity::Day
        };
        days_range(start, tomorrow, granularity, expr)
    } else {
        days_range(shift_days(today, 1 - n, expr)?, tomorrow, TimeGranularity::Day, expr)
    };
    Ok(range)
}

/// Find and resolve the first time expression in lowercased text.
/// Returns `Ok(None)` when the text names no time; reversed absolute ranges are errors.
pub fn resolve(lower: &str, now: NaiveDateTime) -> Result<Option<ResolvedTime>, PipelineError> {
    let today = now.date();

    if let Some(caps) = LAST_N.captures(lower) {
        let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        let n = caps[1]
            .parse::<u64>()
            .map_err(|_| out_of_range(&caps[0]))?;
        let range = resolve_last_n(n, &caps[2], today, &caps[0])?;
        return Ok(Some(ResolvedTime { range, span: whole }));
    }

    if let Some(caps) = DATE_RANGE.captures(lower) {
        let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        let start = parse_date(&caps[1])?;
        let end = parse_date(&caps[2])?;
        if start > end {
            return Err(PipelineError::Analysis(format!(
                "Time range '{}' ends before it starts",
                &caps[0]
            )));
        }
        let end = shift_days(end, 1, &caps[0])?;
        let range = TimeRange {
            start: midnight(start),
            end: midnight(end),
            granularity: TimeGranularity::Day,
            relative: None,
        };
        return Ok(Some(ResolvedTime { range, span: whole }));
    }

    if let Some(m) = SINGLE_DATE.find(lower) {
        let date = parse_date(m.as_str())?;
        let range = TimeRange {
            start: midnight(date),
            end: midnight(shift_days(date, 1, m.as_str())?),
            granularity: TimeGranularity::Day,
            relative: None,
        };
        return Ok(Some(ResolvedTime {
            range,
            span: (m.start(), m.end()),
        }));
    }

    // Earliest phrase wins; the longer phrase wins at the same offset
    let found = PHRASES
        .iter()
        .filter_map(|(phrase, relative)| {
            crate::services::text::first_term(lower, phrase).map(|i| (i, *phrase, *relative))
        })
        .min_by_key(|(i, phrase, _)| (*i, usize::MAX - phrase.len()));

    match found {
        Some((start, phrase, relative)) => {
            let range = resolve_relative(relative, today, phrase)?;
            Ok(Some(ResolvedTime {
                range,
                span: (start, start + phrase.len()),
            }))
        }
        None => Ok(None),
    }
}

/// Resolve a single named expression, as returned by the LLM path
pub fn resolve_expression(expr: &str, now: NaiveDateTime) -> Result<TimeRange, PipelineError> {
    resolve(&expr.to_lowercase(), now)?
        .map(|r| r.range)
        .ok_or_else(|| PipelineError::Analysis(format!("Unrecognised time expression '{}'", expr)))
}
