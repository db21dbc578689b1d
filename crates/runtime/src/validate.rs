//! Field validators for the step dialogs.
//!
//! Each validator turns raw user text into a typed value or a [`Rejection`]
//! whose message is shown verbatim as the re-prompt.

use std::sync::OnceLock;

use bumblebee_store::EntityKind;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use thiserror::Error;

pub const MAX_TITLE: usize = 64;
pub const MAX_DESCRIPTION: usize = 256;
pub const MIN_YEAR: i32 = 1900;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("The name must be one word of letters, digits or underscores. Try again.")]
    NotAWord,
    #[error("You already have a {0} with that name. Enter another one.")]
    Duplicate(EntityKind),
    #[error("Enter the year as a number, for example 2020.")]
    NotAYear,
    #[error("Cars from that year are extinct or not built yet. Enter a year from 1900 to {max}.")]
    YearOutOfRange { max: i32 },
    #[error("The text is empty. Enter some text.")]
    Empty,
    #[error("That is {len} characters, the limit is {max}. Enter a shorter text.")]
    TooLong { len: usize, max: usize },
    #[error("Enter the date and time as YYYY-MM-DD HH:MM, for example 2030-01-31 09:30.")]
    BadDateTime,
    #[error("That moment has already passed. Enter a time in the future.")]
    NotInFuture,
    #[error("Enter the date as YYYY-MM-DD, for example 2024-05-01.")]
    BadDate,
    #[error("The end date cannot be earlier than the start date ({start}). Enter the end date again.")]
    RangeReversed { start: NaiveDate },
    #[error("Enter the price as a number, for example 1500 or 12,50.")]
    BadPrice,
    #[error("The price cannot be negative. Enter the price again.")]
    NegativePrice,
    #[error("Send a photo or press Skip.")]
    PhotoExpected,
    #[error("Send the answer as a text message.")]
    TextExpected,
}

fn word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\w+$").expect("static regex"))
}

fn datetime_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}$").expect("static regex"))
}

fn date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static regex"))
}

fn bounded(input: &str, max: usize) -> Result<String, Rejection> {
    let value = input.trim();
    if value.is_empty() {
        return Err(Rejection::Empty);
    }
    let len = value.chars().count();
    if len > max {
        return Err(Rejection::TooLong { len, max });
    }
    Ok(value.to_string())
}

/// A single word token: vehicle names.
pub fn word(input: &str) -> Result<String, Rejection> {
    let value = bounded(input, MAX_TITLE)?;
    if !word_pattern().is_match(&value) {
        return Err(Rejection::NotAWord);
    }
    Ok(value)
}

pub fn title(input: &str) -> Result<String, Rejection> {
    bounded(input, MAX_TITLE)
}

pub fn description(input: &str) -> Result<String, Rejection> {
    bounded(input, MAX_DESCRIPTION)
}

/// The current calendar year in `tz`.
pub fn current_year(tz: Tz, now: DateTime<Utc>) -> i32 {
    now.with_timezone(&tz).year()
}

/// A model year between 1900 and `max` inclusive.
pub fn year(input: &str, max: i32) -> Result<i32, Rejection> {
    let year: i32 = input.trim().parse().map_err(|_| Rejection::NotAYear)?;
    if !(MIN_YEAR..=max).contains(&year) {
        return Err(Rejection::YearOutOfRange { max });
    }
    Ok(year)
}

/// `YYYY-MM-DD HH:MM` read as local time in `tz`, strictly after `now`.
///
/// A local time skipped by a DST jump is rejected as malformed; an
/// ambiguous one resolves to the earlier instant.
pub fn future_datetime(input: &str, tz: Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>, Rejection> {
    let raw = input.trim();
    if !datetime_pattern().is_match(raw) {
        return Err(Rejection::BadDateTime);
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .map_err(|_| Rejection::BadDateTime)?;
    let local = tz
        .from_local_datetime(&naive)
        .earliest()
        .ok_or(Rejection::BadDateTime)?;
    let at = local.with_timezone(&Utc);
    if at <= now {
        return Err(Rejection::NotInFuture);
    }
    Ok(at)
}

pub fn date(input: &str) -> Result<NaiveDate, Rejection> {
    let raw = input.trim();
    if !date_pattern().is_match(raw) {
        return Err(Rejection::BadDate);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| Rejection::BadDate)
}

/// End of a report range: a date no earlier than `start`.
pub fn end_date(input: &str, start: NaiveDate) -> Result<NaiveDate, Rejection> {
    let end = date(input)?;
    if end < start {
        return Err(Rejection::RangeReversed { start });
    }
    Ok(end)
}

/// Locale-tolerant decimal: spaces are ignored and a comma works as the
/// decimal separator (`"1 500,50"` is 1500.5).
pub fn price(input: &str) -> Result<f64, Rejection> {
    let normalised: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    let value: f64 = normalised.parse().map_err(|_| Rejection::BadPrice)?;
    if !value.is_finite() {
        return Err(Rejection::BadPrice);
    }
    if value < 0.0 {
        return Err(Rejection::NegativePrice);
    }
    Ok(value)
}
