//! Calendar coefficient engine
//!
//! Turns iCalendar text into event intervals and derives the two price
//! coefficients from them:
//! - `egorov`: event density, `events starting today / 10 + 1`
//! - `lesson`: `1.25` while an event is in progress, `1.0` otherwise
//!
//! Parsing never fails. Blocks without a usable `DTSTART` are skipped and
//! a malformed `DTEND` leaves the event open-ended, so one corrupt event
//! cannot invalidate the rest of the feed. Empty text means zero events,
//! which yields neutral coefficients.

use chrono::{NaiveDate, NaiveDateTime, SubsecRound};
use serde::Serialize;

/// `YYYYMMDDTHHMMSS`
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Multiplier applied while an event is in progress.
pub const ACTIVE_LESSON_COEFFICIENT: f64 = 1.25;

/// One scheduled event. Times are calendar wall-clock times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarEvent {
    pub start: NaiveDateTime,
    /// Events without an end are never considered in progress.
    pub end: Option<NaiveDateTime>,
}

impl CalendarEvent {
    pub fn starts_on(&self, date: NaiveDate) -> bool {
        self.start.date() == date
    }

    /// Inclusive on both bounds.
    pub fn contains(&self, instant: NaiveDateTime) -> bool {
        match self.end {
            Some(end) => self.start <= instant && instant <= end,
            None => false,
        }
    }
}

#[derive(Default)]
struct PendingEvent {
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
}

impl PendingEvent {
    fn finish(self) -> Option<CalendarEvent> {
        Some(CalendarEvent {
            start: self.start?,
            end: self.end,
        })
    }
}

/// Extract every `VEVENT` block with a valid start time.
pub fn parse_events(text: &str) -> Vec<CalendarEvent> {
    let mut events = Vec::new();
    let mut pending: Option<PendingEvent> = None;

    for line in text.lines().map(str::trim) {
        if line.eq_ignore_ascii_case("BEGIN:VEVENT") {
            // An unterminated block is dropped when the next one begins.
            pending = Some(PendingEvent::default());
        } else if line.eq_ignore_ascii_case("END:VEVENT") {
            if let Some(event) = pending.take().and_then(PendingEvent::finish) {
                events.push(event);
            }
        } else if let Some(current) = pending.as_mut() {
            if let Some(value) = property_value(line, "DTSTART") {
                current.start = parse_timestamp(value);
            } else if let Some(value) = property_value(line, "DTEND") {
                current.end = parse_timestamp(value);
            }
        }
    }

    events
}

/// Value of `NAME:value` or `NAME;PARAM=...:value`.
fn property_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    let key_name = key.split(';').next()?;
    key_name.eq_ignore_ascii_case(name).then_some(value)
}

/// Parse `YYYYMMDDTHHMMSS`, tolerating a trailing `Z`.
fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    let value = value.strip_suffix('Z').unwrap_or(value);
    let well_formed = value.len() == 15
        && value.bytes().enumerate().all(|(i, b)| {
            if i == 8 {
                b == b'T'
            } else {
                b.is_ascii_digit()
            }
        });
    if !well_formed {
        return None;
    }
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()
}

/// Number of events whose start falls on `date`, ignoring time of day.
pub fn count_events_starting_on(events: &[CalendarEvent], date: NaiveDate) -> usize {
    events.iter().filter(|e| e.starts_on(date)).count()
}

/// Whether any event spans `instant` at second precision.
pub fn is_active_at(events: &[CalendarEvent], instant: NaiveDateTime) -> bool {
    let instant = instant.trunc_subsecs(0);
    events.iter().any(|e| e.contains(instant))
}

/// `count / 10 + 1`; always at least 1.
pub fn egorov_coefficient(events: &[CalendarEvent], date: NaiveDate) -> f64 {
    count_events_starting_on(events, date) as f64 / 10.0 + 1.0
}

pub fn lesson_coefficient(events: &[CalendarEvent], instant: NaiveDateTime) -> f64 {
    if is_active_at(events, instant) {
        ACTIVE_LESSON_COEFFICIENT
    } else {
        1.0
    }
}

/// Both coefficients for one evaluation instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coefficients {
    pub egorov: f64,
    pub lesson: f64,
}

impl Coefficients {
    /// Coefficients of an empty calendar.
    pub const NEUTRAL: Coefficients = Coefficients {
        egorov: 1.0,
        lesson: 1.0,
    };

    pub fn evaluate(events: &[CalendarEvent], now: NaiveDateTime) -> Self {
        Self {
            egorov: egorov_coefficient(events, now.date()),
            lesson: lesson_coefficient(events, now),
        }
    }

    pub fn product(&self) -> f64 {
        self.egorov * self.lesson
    }
}
