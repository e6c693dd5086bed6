//! Sampling schedules and the clock that drives the sampling cycle.
//!
//! A schedule is either a fixed interval or a cron-style calendar
//! specification. Schedules are parsed from the strings used in instrument
//! configuration:
//!
//! - `"60000"`: sample every 60 s, measured from the previous sample (relative)
//! - `"R */30 */1 *"`: relative interval from `*/n` fields (seconds, minutes, hours),
//!   here 1 min 30 s
//! - `"A 0 */15 *"`: absolute, at second 0 of every 15th minute (UTC)
//!
//! All times are epoch milliseconds.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const SECONDS_PER_DAY: i64 = 86_400;

/// How an interval schedule is anchored in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Strictly periodic, measured from the previous fire time.
    Relative,
    /// Aligned to multiples of the period since the epoch.
    Absolute,
}

/// A set of allowed values for one calendar field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMask {
    allowed: Vec<bool>,
}

impl FieldMask {
    fn parse(field: &str, max: u32, name: &str) -> AppResult<Self> {
        let mut allowed = vec![false; max as usize + 1];
        for part in field.split(',') {
            let part = part.trim();
            if part == "*" {
                allowed.iter_mut().for_each(|a| *a = true);
            } else if let Some(step) = part.strip_prefix("*/") {
                let step: u32 = parse_number(step, name)?;
                if step == 0 {
                    return Err(DaqError::Configuration(format!(
                        "{name}: step must be positive"
                    )));
                }
                (0..=max).step_by(step as usize).for_each(|v| allowed[v as usize] = true);
            } else if let Some((lo, hi)) = part.split_once('-') {
                let lo: u32 = parse_number(lo, name)?;
                let hi: u32 = parse_number(hi, name)?;
                if lo > hi || hi > max {
                    return Err(DaqError::Configuration(format!(
                        "{name}: invalid range {part}"
                    )));
                }
                (lo..=hi).for_each(|v| allowed[v as usize] = true);
            } else {
                let v: u32 = parse_number(part, name)?;
                if v > max {
                    return Err(DaqError::Configuration(format!(
                        "{name}: {v} out of range 0-{max}"
                    )));
                }
                allowed[v as usize] = true;
            }
        }
        Ok(Self { allowed })
    }

    fn contains(&self, value: u32) -> bool {
        self.allowed.get(value as usize).copied().unwrap_or(false)
    }
}

/// Cron-style calendar specification, evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarSpec {
    seconds: FieldMask,
    minutes: FieldMask,
    hours: FieldMask,
    min_gap_ms: i64,
    source: String,
}

impl CalendarSpec {
    fn matches(&self, t: &DateTime<Utc>) -> bool {
        self.seconds.contains(t.second())
            && self.minutes.contains(t.minute())
            && self.hours.contains(t.hour())
    }

    /// First whole second strictly after `now_ms` matching every field.
    fn next_after(&self, now_ms: i64) -> Option<i64> {
        let start = now_ms.div_euclid(MS_PER_SECOND) + 1;
        (start..=start + SECONDS_PER_DAY).find_map(|sec| {
            let t = DateTime::<Utc>::from_timestamp(sec, 0)?;
            self.matches(&t).then_some(sec * MS_PER_SECOND)
        })
    }

    /// Smallest gap between consecutive fire times within a day.
    fn compute_min_gap_ms(&self) -> i64 {
        let fires: Vec<i64> = (0..SECONDS_PER_DAY)
            .filter(|sec| {
                DateTime::<Utc>::from_timestamp(*sec, 0)
                    .map(|t| self.matches(&t))
                    .unwrap_or(false)
            })
            .collect();
        match fires.as_slice() {
            [] => 0,
            [_] => SECONDS_PER_DAY * MS_PER_SECOND,
            _ => {
                let wrap = fires[0] + SECONDS_PER_DAY - fires[fires.len() - 1];
                fires
                    .windows(2)
                    .map(|w| w[1] - w[0])
                    .chain(std::iter::once(wrap))
                    .min()
                    .unwrap_or(0)
                    * MS_PER_SECOND
            }
        }
    }
}

/// When the sampling cycle should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleSchedule {
    /// Fixed period in milliseconds.
    Interval {
        /// Period between samples, always > 0.
        period_ms: i64,
        /// Relative or absolute anchoring.
        anchor: Anchor,
    },
    /// Cron-style specification (always absolute).
    Calendar(CalendarSpec),
}

impl SampleSchedule {
    /// Relative interval schedule. Fails if the period is not positive.
    pub fn every(period: Duration) -> AppResult<Self> {
        Self::interval(duration_ms(period), Anchor::Relative)
    }

    /// Interval schedule with explicit anchoring.
    pub fn interval(period_ms: i64, anchor: Anchor) -> AppResult<Self> {
        if period_ms <= 0 {
            return Err(DaqError::Configuration(format!(
                "schedule period must be positive, got {period_ms} ms"
            )));
        }
        Ok(SampleSchedule::Interval { period_ms, anchor })
    }

    /// Whether the schedule is measured from the previous fire time.
    pub fn is_relative(&self) -> bool {
        matches!(
            self,
            SampleSchedule::Interval {
                anchor: Anchor::Relative,
                ..
            }
        )
    }

    /// Nominal time between samples, used to size detector windows.
    pub fn nominal_period_ms(&self) -> i64 {
        match self {
            SampleSchedule::Interval { period_ms, .. } => *period_ms,
            SampleSchedule::Calendar(spec) => spec.min_gap_ms,
        }
    }

    /// Nominal sample interval in whole seconds.
    pub fn nominal_period_secs(&self) -> u64 {
        u64::try_from(self.nominal_period_ms() / MS_PER_SECOND).unwrap_or(0)
    }

    /// Next fire time given the current time and the last fire time.
    pub fn next_fire(&self, now_ms: i64, last_fire_ms: Option<i64>) -> i64 {
        match self {
            SampleSchedule::Interval {
                period_ms,
                anchor: Anchor::Relative,
            } => match last_fire_ms {
                None => now_ms,
                Some(last) => {
                    let next = last.saturating_add(*period_ms);
                    if next >= now_ms {
                        next
                    } else {
                        // Skip whole periods missed while a cycle overran.
                        let missed = (now_ms - last).div_euclid(*period_ms);
                        let next = last.saturating_add(missed.saturating_mul(*period_ms));
                        if next >= now_ms {
                            next
                        } else {
                            next.saturating_add(*period_ms)
                        }
                    }
                }
            },
            SampleSchedule::Interval {
                period_ms,
                anchor: Anchor::Absolute,
            } => (now_ms.div_euclid(*period_ms) + 1).saturating_mul(*period_ms),
            SampleSchedule::Calendar(spec) => spec
                .next_after(now_ms)
                .unwrap_or(now_ms + SECONDS_PER_DAY * MS_PER_SECOND),
        }
    }
}

impl FromStr for SampleSchedule {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(period_ms) = s.parse::<i64>() {
            return Self::interval(period_ms, Anchor::Relative);
        }

        let fields: Vec<&str> = s.split_whitespace().collect();
        let [kind, sec, min, hour] = fields.as_slice() else {
            return Err(DaqError::Configuration(format!(
                "schedule '{s}' must be an integer period or '<R|A> <sec> <min> <hour>'"
            )));
        };

        match kind.to_ascii_uppercase().as_str() {
            "R" => {
                let mut period_ms: i64 = 0;
                for (field, name, unit_ms) in [
                    (sec, "seconds", MS_PER_SECOND),
                    (min, "minutes", MS_PER_MINUTE),
                    (hour, "hours", MS_PER_HOUR),
                ] {
                    period_ms = i64::try_from(relative_field(field, name)?)
                        .ok()
                        .and_then(|n| n.checked_mul(unit_ms))
                        .and_then(|ms| ms.checked_add(period_ms))
                        .ok_or_else(|| {
                            DaqError::Configuration(format!("schedule '{s}' period is too long"))
                        })?;
                }
                Self::interval(period_ms, Anchor::Relative)
            }
            "A" => {
                let mut spec = CalendarSpec {
                    seconds: FieldMask::parse(sec, 59, "seconds")?,
                    minutes: FieldMask::parse(min, 59, "minutes")?,
                    hours: FieldMask::parse(hour, 23, "hours")?,
                    min_gap_ms: 0,
                    source: s.to_string(),
                };
                spec.min_gap_ms = spec.compute_min_gap_ms();
                if spec.min_gap_ms <= 0 {
                    return Err(DaqError::Configuration(format!(
                        "schedule '{s}' never fires"
                    )));
                }
                Ok(SampleSchedule::Calendar(spec))
            }
            other => Err(DaqError::Configuration(format!(
                "invalid schedule type '{other}', expected R or A"
            ))),
        }
    }
}

impl fmt::Display for SampleSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleSchedule::Interval {
                period_ms,
                anchor: Anchor::Relative,
            } => write!(f, "every {period_ms} ms"),
            SampleSchedule::Interval {
                period_ms,
                anchor: Anchor::Absolute,
            } => write!(f, "every {period_ms} ms (aligned)"),
            SampleSchedule::Calendar(spec) => write!(f, "{}", spec.source),
        }
    }
}

fn parse_number<T: FromStr>(s: &str, name: &str) -> AppResult<T> {
    s.trim()
        .parse()
        .map_err(|_| DaqError::Configuration(format!("{name}: '{s}' is not a number")))
}

/// Relative schedules only accept `*` (zero) or `*/n` with `n > 0` in each
/// field.
fn relative_field(field: &str, name: &str) -> AppResult<u64> {
    if field == "*" {
        return Ok(0);
    }
    let step = field.strip_prefix("*/").ok_or_else(|| {
        DaqError::Configuration(format!(
            "{name}: relative schedules take '*' or '*/n', got '{field}'"
        ))
    })?;
    match parse_number::<u64>(step, name)? {
        0 => Err(DaqError::Configuration(format!("{name}: step must be positive"))),
        n => Ok(n),
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Converts successive schedule fire times into sleeps.
#[derive(Debug, Clone)]
pub struct ScheduleClock {
    schedule: SampleSchedule,
    last_fire_ms: Option<i64>,
}

impl ScheduleClock {
    /// Clock that has not fired yet.
    pub fn new(schedule: SampleSchedule) -> Self {
        Self {
            schedule,
            last_fire_ms: None,
        }
    }

    /// Active schedule.
    pub fn schedule(&self) -> &SampleSchedule {
        &self.schedule
    }

    /// Replace the schedule. The next fire time is computed from the new
    /// schedule; the last fire time is kept for relative anchoring.
    pub fn set_schedule(&mut self, schedule: SampleSchedule) {
        debug!(old = %self.schedule, new = %schedule, "schedule changed");
        self.schedule = schedule;
    }

    /// Time of the previous tick, if any.
    pub fn last_fire_ms(&self) -> Option<i64> {
        self.last_fire_ms
    }

    /// Next fire time relative to `now_ms`.
    pub fn next_fire(&self, now_ms: i64) -> i64 {
        self.schedule.next_fire(now_ms, self.last_fire_ms)
    }

    /// Record that a tick fired at `fire_ms`.
    pub fn mark_fired(&mut self, fire_ms: i64) {
        self.last_fire_ms = Some(fire_ms);
    }

    /// Sleep until the next fire time, record it, and return it.
    pub async fn wait_next(&mut self) -> i64 {
        let now = now_ms();
        let fire = self.next_fire(now);
        let delay = u64::try_from(fire.saturating_sub(now)).unwrap_or(0);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.mark_fired(fire);
        fire
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_schedule_is_relative_interval() {
        let schedule: SampleSchedule = "60000".parse().unwrap();
        assert_eq!(
            schedule,
            SampleSchedule::Interval {
                period_ms: 60_000,
                anchor: Anchor::Relative
            }
        );
        assert!(schedule.is_relative());
        assert_eq!(schedule.nominal_period_secs(), 60);
    }

    #[test]
    fn zero_or_negative_period_rejected() {
        assert!("0".parse::<SampleSchedule>().is_err());
        assert!("-5".parse::<SampleSchedule>().is_err());
        assert!("R * * *".parse::<SampleSchedule>().is_err());
        assert!(SampleSchedule::every(Duration::ZERO).is_err());
    }

    #[test]
    fn relative_fields_sum_to_period() {
        let schedule: SampleSchedule = "R */30 */1 *".parse().unwrap();
        assert_eq!(schedule.nominal_period_ms(), 90_000);
    }

    #[test]
    fn relative_steps_must_be_positive_and_fit() {
        let err = "R * * */9223372036854775807".parse::<SampleSchedule>().unwrap_err();
        assert!(err.to_string().contains("too long"), "{err}");
        assert!("R */-30 */1 *".parse::<SampleSchedule>().is_err());
        assert!("R */0 */1 *".parse::<SampleSchedule>().is_err());
    }

    #[test]
    fn relative_next_fire() {
        let schedule = SampleSchedule::interval(1_000, Anchor::Relative).unwrap();
        assert_eq!(schedule.next_fire(5_000, None), 5_000);
        assert_eq!(schedule.next_fire(5_200, Some(5_000)), 6_000);
        // Cycle overran by 2.5 periods: next tick stays on the original grid.
        assert_eq!(schedule.next_fire(7_500, Some(5_000)), 8_000);
    }

    #[test]
    fn absolute_next_fire_is_aligned() {
        let schedule = SampleSchedule::interval(10_000, Anchor::Absolute).unwrap();
        assert_eq!(schedule.next_fire(12_345, None), 20_000);
        assert_eq!(schedule.next_fire(20_000, Some(20_000)), 30_000);
    }

    #[test]
    fn calendar_next_fire() {
        let schedule: SampleSchedule = "A 0 */15 *".parse().unwrap();
        // 1970-01-01T00:07:12Z -> 00:15:00
        assert_eq!(schedule.next_fire(432_000, None), 900_000);
        // exactly on a fire time moves to the next one
        assert_eq!(schedule.next_fire(900_000, Some(900_000)), 1_800_000);
        assert_eq!(schedule.nominal_period_ms(), 900_000);
    }

    #[test]
    fn calendar_lists_and_ranges() {
        let schedule: SampleSchedule = "A 0,30 0 1-2".parse().unwrap();
        // 00:00:00 -> 01:00:00
        assert_eq!(schedule.next_fire(0, None), 3_600_000);
        assert_eq!(schedule.next_fire(3_600_000, None), 3_630_000);
        assert!("A 60 * *".parse::<SampleSchedule>().is_err());
        assert!("X 0 * *".parse::<SampleSchedule>().is_err());
    }

    #[test]
    fn clock_tracks_last_fire() {
        let mut clock = ScheduleClock::new(SampleSchedule::interval(500, Anchor::Relative).unwrap());
        assert_eq!(clock.last_fire_ms(), None);
        assert_eq!(clock.next_fire(100), 100);
        clock.mark_fired(100);
        assert_eq!(clock.last_fire_ms(), Some(100));
        assert_eq!(clock.next_fire(120), 600);
        clock.set_schedule(SampleSchedule::interval(1_000, Anchor::Relative).unwrap());
        assert_eq!(clock.next_fire(120), 1_100);
    }
}
