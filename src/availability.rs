//! Slot arithmetic for a single nurse on a single day.
//!
//! All intervals are half-open `[start, end)` in minutes since midnight, so an appointment
//! ending at 10:30 does not collide with one starting at 10:30.

use crate::db_types::{Appointment, AvailabilityOverride, AvailabilityRule};

use std::fmt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Time};

pub const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const CLOCK_FORMAT: &[FormatItem<'static>] = format_description!("[hour]:[minute]");
const CLOCK_SECONDS_FORMAT: &[FormatItem<'static>] =
    format_description!("[hour]:[minute]:[second]");

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: u16,
    pub end: u16,
}

impl Interval {
    pub fn new(start: u16, end: u16) -> Option<Self> {
        (start < end && end <= MINUTES_PER_DAY).then_some(Self { start, end })
    }

    pub fn from_times(start: Time, end: Time) -> Option<Self> {
        Self::new(minute_of_day(start), minute_of_day(end))
    }

    /// Window of `minutes` starting at `start`; `None` when it would run past midnight.
    pub fn starting_at(start: Time, minutes: u16) -> Option<Self> {
        let start = minute_of_day(start);
        Self::new(start, start.checked_add(minutes)?)
    }

    pub fn of_appointment(appointment: &Appointment) -> Option<Self> {
        let minutes = u16::try_from(appointment.duration_minutes).ok()?;
        Self::starting_at(appointment.appointment_time, minutes)
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn minutes(&self) -> u16 {
        self.end - self.start
    }

    pub fn start_time(&self) -> Time {
        time_of_minute(self.start)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", format_minute(self.start), format_minute(self.end))
    }
}

pub fn minute_of_day(t: Time) -> u16 {
    t.hour() as u16 * 60 + t.minute() as u16
}

fn time_of_minute(minute: u16) -> Time {
    let minute = minute.min(MINUTES_PER_DAY - 1);
    Time::from_hms((minute / 60) as u8, (minute % 60) as u8, 0).unwrap_or(Time::MIDNIGHT)
}

/// `YYYY-MM-DD`
pub fn parse_date(s: &str) -> Option<Date> {
    Date::parse(s.trim(), DATE_FORMAT).ok()
}

/// 24-hour `HH:MM`, optionally with seconds.
pub fn parse_clock(s: &str) -> Option<Time> {
    let s = s.trim();
    Time::parse(s, CLOCK_FORMAT)
        .or_else(|_| Time::parse(s, CLOCK_SECONDS_FORMAT))
        .ok()
}

pub fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT).unwrap_or_else(|_| date.to_string())
}

/// `HH:MM`, with the end of day rendered as `24:00`.
pub fn format_minute(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// The windows a nurse works on `date`. A date override replaces the weekly rules for that
/// date; an available override with no explicit window keeps the weekly rules.
pub fn effective_windows(
    date: Date,
    rules: &[AvailabilityRule],
    day_override: Option<&AvailabilityOverride>,
) -> Vec<Interval> {
    if let Some(o) = day_override.filter(|o| o.override_date == date) {
        if !o.is_available {
            return vec![];
        }
        if let (Some(start), Some(end)) = (o.start_time, o.end_time) {
            return Interval::from_times(start, end).into_iter().collect();
        }
    }
    let weekday = date.weekday();
    let windows = rules
        .iter()
        .filter(|r| r.applies_on(weekday))
        .filter_map(|r| Interval::from_times(r.start_time, r.end_time))
        .collect();
    merge(windows)
}

/// Sort and coalesce overlapping or touching intervals.
pub fn merge(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for next in intervals {
        match merged.last_mut() {
            Some(last) if next.start <= last.end => last.end = last.end.max(next.end),
            _ => merged.push(next),
        }
    }
    merged
}

/// Remove every booked window from the working windows, returning ordered free intervals.
pub fn subtract(windows: &[Interval], booked: &[Interval]) -> Vec<Interval> {
    let booked = merge(booked.to_vec());
    let mut free = Vec::new();
    for window in merge(windows.to_vec()) {
        let mut cursor = window.start;
        for b in booked.iter().filter(|b| b.overlaps(&window)) {
            if b.start > cursor {
                free.push(Interval {
                    start: cursor,
                    end: b.start,
                });
            }
            cursor = cursor.max(b.end);
        }
        if cursor < window.end {
            free.push(Interval {
                start: cursor,
                end: window.end,
            });
        }
    }
    free
}

pub fn fits(free: &[Interval], wanted: &Interval) -> bool {
    free.iter().any(|f| f.contains(wanted))
}

/// Start times of `duration` minutes that fit in `free`, nearest to `requested` first (ties go
/// to the earlier start), capped at `limit` and returned in chronological order. Candidates are
/// the start of each free interval plus every `step`-aligned minute inside it; the requested
/// start itself is never offered back.
pub fn nearest_alternatives(
    free: &[Interval],
    requested: &Interval,
    duration: u16,
    step: u16,
    limit: usize,
) -> Vec<Interval> {
    let step = step.max(1);
    let mut candidates: Vec<Interval> = Vec::new();
    for f in free {
        let aligned = f.start.div_ceil(step) * step;
        let starts = std::iter::once(f.start).chain((aligned..f.end).step_by(step as usize));
        for start in starts {
            if let Some(slot) = Interval::new(start, start.saturating_add(duration)) {
                if f.contains(&slot) && slot.start != requested.start && !candidates.contains(&slot)
                {
                    candidates.push(slot);
                }
            }
        }
    }
    candidates.sort_by_key(|c| (c.start.abs_diff(requested.start), c.start));
    candidates.truncate(limit);
    candidates.sort();
    candidates
}
