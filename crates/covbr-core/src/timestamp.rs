//! Source update-time resolution.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::PipelineError;

/// `05/04/2020 às 18:00`, `05/04/2020 18h00`, `5/4/2020 - 18:00:30`.
static DAY_MONTH_YEAR_AT_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})\D+?(\d{1,2})[:h](\d{2})(?::(\d{2}))?")
        .expect("static regex")
});

/// Brasília time, the offset every known source reports in.
pub fn brasilia_offset() -> FixedOffset {
    FixedOffset::west_opt(3 * 3600).expect("-03:00 is a valid offset")
}

/// Parse `+HH:MM` / `-HH:MM` / `Z`.
pub fn parse_utc_offset(text: &str) -> Option<FixedOffset> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("z") || text.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Resolve the text a source reports as its update time into an absolute instant.
///
/// Accepted shapes, tried in order: ISO-8601 with its own offset, epoch seconds or
/// milliseconds, and day/month/year + time interpreted at `local_offset`.
pub fn resolve(text: &str, local_offset: FixedOffset) -> Result<DateTime<Utc>, PipelineError> {
    let trimmed = text.trim();
    let fail = || PipelineError::UnparsableTimestamp(text.to_string());
    if trimmed.is_empty() {
        return Err(fail());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let value: i64 = trimmed.parse().map_err(|_| fail())?;
        let resolved = if trimmed.len() >= 12 {
            DateTime::from_timestamp_millis(value)
        } else {
            DateTime::from_timestamp(value, 0)
        };
        return resolved.ok_or_else(fail);
    }

    let caps = DAY_MONTH_YEAR_AT_TIME.captures(trimmed).ok_or_else(fail)?;
    let field = |idx: usize| -> Result<u32, PipelineError> {
        caps.get(idx)
            .map_or(Ok(0), |m| m.as_str().parse::<u32>().map_err(|_| fail()))
    };
    let year = caps[3].parse::<i32>().map_err(|_| fail())?;
    let date = NaiveDate::from_ymd_opt(year, field(2)?, field(1)?).ok_or_else(fail)?;
    let time = NaiveTime::from_hms_opt(field(4)?, field(5)?, field(6)?).ok_or_else(fail)?;
    local_offset
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso_millis;

    #[test]
    fn day_month_year_is_reordered_and_shifted() {
        let resolved = resolve("05/04/2020 18:00", brasilia_offset()).unwrap();
        assert_eq!(iso_millis::format(&resolved), "2020-04-05T21:00:00.000Z");
    }

    #[test]
    fn dashboard_footer_text_resolves() {
        let resolved = resolve(
            "Dados atualizados em 05/04/2020 às 18:00",
            parse_utc_offset("-03:00").unwrap(),
        )
        .unwrap();
        assert_eq!(iso_millis::format(&resolved), "2020-04-05T21:00:00.000Z");
        let hours = resolve("28/03/2020 - 17h30", brasilia_offset()).unwrap();
        assert_eq!(iso_millis::format(&hours), "2020-03-28T20:30:00.000Z");
    }

    #[test]
    fn iso_and_epoch_inputs() {
        let iso = resolve("2020-04-05T18:00:00.000-03:00", brasilia_offset()).unwrap();
        assert_eq!(iso_millis::format(&iso), "2020-04-05T21:00:00.000Z");
        let millis = resolve("1586120400000", brasilia_offset()).unwrap();
        assert_eq!(millis, iso);
        let secs = resolve("1586120400", brasilia_offset()).unwrap();
        assert_eq!(secs, iso);
    }

    #[test]
    fn garbage_is_a_hard_failure() {
        for text in ["", "   ", "ontem", "32/13/2020 18:00", "05/04/2020", "05/04/2020 25:00"] {
            assert!(
                matches!(resolve(text, brasilia_offset()), Err(PipelineError::UnparsableTimestamp(_))),
                "{text:?} should fail"
            );
        }
    }

    #[test]
    fn offsets_parse() {
        assert_eq!(parse_utc_offset("-03:00"), FixedOffset::west_opt(3 * 3600));
        assert_eq!(parse_utc_offset("+05:30"), FixedOffset::east_opt(5 * 3600 + 1800));
        assert_eq!(parse_utc_offset("Z"), FixedOffset::east_opt(0));
        assert_eq!(parse_utc_offset("03:00"), None);
    }
}
