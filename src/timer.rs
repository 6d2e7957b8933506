//! ISO-8601 durations for timer catch events.
//!
//! Accepted form: `P[nY][nM][nW][nD][T[nH][nM][nS]]`. Years count as 365
//! days and months as 30 days. The last component may carry a fraction.

use chrono::{DateTime, Duration, Utc};
use nom::{
    branch::alt,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize},
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};

const SECOND_MS: f64 = 1_000.0;
const MINUTE_MS: f64 = 60.0 * SECOND_MS;
const HOUR_MS: f64 = 60.0 * MINUTE_MS;
const DAY_MS: f64 = 24.0 * HOUR_MS;

/// Upper bound keeps the millisecond count inside chrono's range.
const MAX_MS: f64 = 1.0e15;

#[derive(Debug, Default, PartialEq)]
struct Parts {
    years: Option<f64>,
    months: Option<f64>,
    weeks: Option<f64>,
    days: Option<f64>,
    time: Option<(Option<f64>, Option<f64>, Option<f64>)>,
}

fn component<'a>(designator: char) -> impl FnMut(&'a str) -> IResult<&'a str, f64> {
    terminated(
        map_res(
            recognize(pair(digit1, opt(pair(alt((char('.'), char(','))), digit1)))),
            |s: &str| s.replace(',', ".").parse::<f64>(),
        ),
        char(designator),
    )
}

fn iso_duration(input: &str) -> IResult<&str, Parts> {
    let (input, _) = char('P')(input)?;
    let (input, (years, months, weeks, days)) = tuple((
        opt(component('Y')),
        opt(component('M')),
        opt(component('W')),
        opt(component('D')),
    ))(input)?;
    let (input, time) = opt(preceded(
        char('T'),
        tuple((
            opt(component('H')),
            opt(component('M')),
            opt(component('S')),
        )),
    ))(input)?;
    Ok((
        input,
        Parts {
            years,
            months,
            weeks,
            days,
            time,
        },
    ))
}

/// Parse an ISO-8601 duration such as `PT1S`, `P1DT12H` or `PT0.5S`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (_, parts) = all_consuming(iso_duration)(text)
        .map_err(|_| format!("'{text}' is not an ISO-8601 duration"))?;

    let date = [parts.years, parts.months, parts.weeks, parts.days];
    let (hours, minutes, seconds) = match parts.time {
        Some((None, None, None)) => return Err("time designator 'T' without components".into()),
        Some(time) => time,
        None => (None, None, None),
    };
    if date.iter().all(Option::is_none) && parts.time.is_none() {
        return Err("duration has no components".into());
    }

    let ms = parts.years.unwrap_or(0.0) * 365.0 * DAY_MS
        + parts.months.unwrap_or(0.0) * 30.0 * DAY_MS
        + parts.weeks.unwrap_or(0.0) * 7.0 * DAY_MS
        + parts.days.unwrap_or(0.0) * DAY_MS
        + hours.unwrap_or(0.0) * HOUR_MS
        + minutes.unwrap_or(0.0) * MINUTE_MS
        + seconds.unwrap_or(0.0) * SECOND_MS;
    if !ms.is_finite() || ms > MAX_MS {
        return Err(format!("duration '{text}' is out of range"));
    }
    Ok(Duration::milliseconds(ms.round() as i64))
}

/// Due time for a timer created at `now`.
pub fn due_at(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now + duration
}

/// A timer fires strictly after its due time.
pub fn is_due(now: DateTime<Utc>, due_at: DateTime<Utc>) -> bool {
    now > due_at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_common_durations() {
        assert_eq!(parse_duration("PT1S").unwrap(), Duration::seconds(1));
        assert_eq!(parse_duration(" PT5M ").unwrap(), Duration::minutes(5));
        assert_eq!(
            parse_duration("P1DT12H").unwrap(),
            Duration::hours(36)
        );
        assert_eq!(parse_duration("P2W").unwrap(), Duration::days(14));
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::milliseconds(500));
        assert_eq!(parse_duration("PT1,25S").unwrap(), Duration::milliseconds(1250));
    }

    #[test]
    fn test_month_and_minute_share_designator() {
        assert_eq!(parse_duration("P1M").unwrap(), Duration::days(30));
        assert_eq!(parse_duration("PT1M").unwrap(), Duration::minutes(1));
        assert_eq!(parse_duration("P1Y").unwrap(), Duration::days(365));
    }

    #[test]
    fn test_invalid_durations() {
        for bad in ["", "P", "PT", "1S", "PT1X", "P1S", "PT1H2D", "pt1s", "P1.5"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_is_due_is_strict() {
        let now = Utc::now();
        let due = due_at(now, Duration::seconds(1));
        assert!(!is_due(now, due));
        assert!(!is_due(due, due));
        assert!(is_due(due + Duration::milliseconds(1), due));
    }
}
