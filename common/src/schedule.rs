use std::{fmt, str::FromStr};

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike,
    Weekday,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    config::validate_target,
    error::{HeatingError, Result},
    types::PresetMode,
};

const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    #[serde(alias = "monday")]
    Mon,
    #[serde(alias = "tuesday")]
    Tue,
    #[serde(alias = "wednesday")]
    Wed,
    #[serde(alias = "thursday")]
    Thu,
    #[serde(alias = "friday")]
    Fri,
    #[serde(alias = "saturday")]
    Sat,
    #[serde(alias = "sunday")]
    Sun,
}

impl DayOfWeek {
    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index % 7 {
            0 => Self::Mon,
            1 => Self::Tue,
            2 => Self::Wed,
            3 => Self::Thu,
            4 => Self::Fri,
            5 => Self::Sat,
            _ => Self::Sun,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }

    pub fn previous(self) -> Self {
        Self::from_index(self.index() + 6)
    }
}

/// Wall-clock time of day in whole minutes. `24:00` marks the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockTime(u16);

impl ClockTime {
    pub const MIDNIGHT: ClockTime = ClockTime(0);
    pub const END_OF_DAY: ClockTime = ClockTime(MINUTES_PER_DAY);

    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if minute >= 60 || hour > 24 || (hour == 24 && minute != 0) {
            return None;
        }
        Some(Self((hour * 60 + minute) as u16))
    }

    pub fn of(time: &impl Timelike) -> Self {
        Self((time.hour() * 60 + time.minute()) as u16)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u32 {
        u32::from(self.0 / 60)
    }

    pub fn minute(self) -> u32 {
        u32::from(self.0 % 60)
    }

    /// Local timestamp of this clock time on `date`; `24:00` rolls to the next day.
    pub fn on(self, date: NaiveDate) -> Option<NaiveDateTime> {
        let base = date.and_hms_opt(0, 0, 0)?;
        Some(base + Duration::minutes(i64::from(self.0)))
    }

    fn end_of_day() -> Self {
        Self::END_OF_DAY
    }
}

impl FromStr for ClockTime {
    type Err = HeatingError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || HeatingError::validation(format!("malformed time '{value}' (HH:MM)"));
        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse::<u32>().map_err(|_| invalid())?;
        // Tolerate "HH:MM:SS" by ignoring seconds.
        let minute = minute.split(':').next().unwrap_or_default();
        let minute = minute.parse::<u32>().map_err(|_| invalid())?;
        Self::from_hm(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// What a schedule sets: a raw temperature or a preset, never both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged, try_from = "RawScheduleTarget")]
pub enum ScheduleTarget {
    Preset { preset_mode: PresetMode },
    Temperature { temperature: f32 },
}

#[derive(Deserialize)]
struct RawScheduleTarget {
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    preset_mode: Option<PresetMode>,
}

impl TryFrom<RawScheduleTarget> for ScheduleTarget {
    type Error = HeatingError;

    fn try_from(raw: RawScheduleTarget) -> Result<Self> {
        match (raw.temperature, raw.preset_mode) {
            (Some(temperature), None) => Ok(Self::Temperature { temperature }),
            (None, Some(preset_mode)) => Ok(Self::Preset { preset_mode }),
            (Some(_), Some(_)) => Err(HeatingError::validation(
                "schedule sets both temperature and preset_mode",
            )),
            (None, None) => Err(HeatingError::validation(
                "schedule needs a temperature or a preset_mode",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub days: Vec<DayOfWeek>,
    pub start_time: ClockTime,
    #[serde(default = "ClockTime::end_of_day")]
    pub end_time: ClockTime,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub target: ScheduleTarget,
}

fn default_enabled() -> bool {
    true
}

impl Schedule {
    pub fn recurring(
        id: impl Into<String>,
        days: Vec<DayOfWeek>,
        start_time: ClockTime,
        end_time: ClockTime,
        target: ScheduleTarget,
    ) -> Self {
        Self {
            id: id.into(),
            date: None,
            days,
            start_time,
            end_time,
            enabled: true,
            target,
        }
    }

    pub fn one_off(
        id: impl Into<String>,
        date: NaiveDate,
        start_time: ClockTime,
        end_time: ClockTime,
        target: ScheduleTarget,
    ) -> Self {
        Self {
            id: id.into(),
            date: Some(date),
            days: Vec::new(),
            start_time,
            end_time,
            enabled: true,
            target,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(HeatingError::validation("schedule id cannot be empty"));
        }
        if self.start_time == ClockTime::END_OF_DAY {
            return Err(HeatingError::validation("schedule cannot start at 24:00"));
        }
        if self.start_time == self.end_time {
            return Err(HeatingError::validation(format!(
                "schedule {} has an empty window",
                self.id
            )));
        }
        if self.date.is_some() && self.crosses_midnight() {
            return Err(HeatingError::validation(format!(
                "one-off schedule {} cannot cross midnight",
                self.id
            )));
        }
        match self.target {
            ScheduleTarget::Temperature { temperature } => {
                validate_target(temperature)?;
            }
            ScheduleTarget::Preset { preset_mode } => {
                if matches!(preset_mode, PresetMode::None | PresetMode::Boost) {
                    return Err(HeatingError::validation(format!(
                        "schedule preset '{preset_mode}' is not allowed"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn applies_on(&self, day: DayOfWeek) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    pub fn crosses_midnight(&self) -> bool {
        self.start_time > self.end_time
    }

    fn contains_same_day(&self, time: ClockTime) -> bool {
        self.start_time <= time && time < self.end_time
    }
}

/// Resolve the single schedule in force at `now`.
///
/// One-off schedules win over recurring ones. Recurring schedules resolve as:
/// a midnight-crossing window begun yesterday, then one begun today, then an
/// ordinary same-day window (latest start wins on overlap).
pub fn find_active(schedules: &[Schedule], now: NaiveDateTime) -> Option<&Schedule> {
    let date = now.date();
    let time = ClockTime::of(&now);
    let today = DayOfWeek::from_chrono(now.weekday());
    let yesterday = today.previous();

    let enabled = || schedules.iter().filter(|schedule| schedule.enabled);
    let recurring = || enabled().filter(|schedule| schedule.date.is_none());

    if let Some(one_off) = enabled()
        .filter(|schedule| schedule.date == Some(date))
        .filter(|schedule| schedule.contains_same_day(time))
        .max_by_key(|schedule| schedule.start_time)
    {
        return Some(one_off);
    }

    if let Some(carried) = recurring().find(|schedule| {
        schedule.applies_on(yesterday) && schedule.crosses_midnight() && time < schedule.end_time
    }) {
        return Some(carried);
    }

    if let Some(tonight) = recurring().find(|schedule| {
        schedule.applies_on(today) && schedule.crosses_midnight() && time >= schedule.start_time
    }) {
        return Some(tonight);
    }

    recurring()
        .filter(|schedule| {
            schedule.applies_on(today)
                && !schedule.crosses_midnight()
                && schedule.contains_same_day(time)
        })
        .max_by_key(|schedule| schedule.start_time)
}

/// Epoch seconds of the next schedule start or end after `now`.
pub fn next_event_epoch(schedules: &[Schedule], now: DateTime<FixedOffset>) -> Option<i64> {
    let local_now = now.naive_local();
    let mut best: Option<NaiveDateTime> = None;

    for day_offset in 0..=7i64 {
        let date = local_now.date() + Duration::days(day_offset);
        let day = DayOfWeek::from_chrono(date.weekday());

        for schedule in schedules.iter().filter(|schedule| schedule.enabled) {
            let on_this_day = match schedule.date {
                Some(one_off) => one_off == date,
                None => schedule.applies_on(day),
            };
            if !on_this_day {
                continue;
            }

            let end_date = if schedule.crosses_midnight() {
                date + Duration::days(1)
            } else {
                date
            };

            let candidates = [
                schedule.start_time.on(date),
                schedule.end_time.on(end_date),
            ];
            for candidate in candidates.into_iter().flatten() {
                if candidate <= local_now {
                    continue;
                }
                if best.map(|current| candidate < current).unwrap_or(true) {
                    best = Some(candidate);
                }
            }
        }
    }

    best.and_then(|naive| now.offset().from_local_datetime(&naive).single())
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        fixed_time(day, hour, minute).naive_local()
    }

    fn hm(value: &str) -> ClockTime {
        value.parse().unwrap()
    }

    fn temp(id: &str, days: Vec<DayOfWeek>, start: &str, end: &str, t: f32) -> Schedule {
        Schedule::recurring(
            id,
            days,
            hm(start),
            hm(end),
            ScheduleTarget::Temperature { temperature: t },
        )
    }

    // Jan 3, 2026 is a Saturday; Jan 4 a Sunday; Jan 5 a Monday.

    #[test]
    fn overnight_schedule_resolves_on_both_days() {
        let schedules = vec![
            temp("night", vec![DayOfWeek::Sat], "22:00", "07:00", 17.0),
            temp("sunday", vec![DayOfWeek::Sun], "06:00", "12:00", 21.0),
        ];

        let saturday_late = find_active(&schedules, at(3, 23, 0)).unwrap();
        assert_eq!(saturday_late.id, "night");

        let sunday_early = find_active(&schedules, at(4, 5, 0)).unwrap();
        assert_eq!(sunday_early.id, "night");

        // The Sunday window overlaps but must not preempt before 07:00.
        let sunday_overlap = find_active(&schedules, at(4, 6, 30)).unwrap();
        assert_eq!(sunday_overlap.id, "night");

        let sunday_later = find_active(&schedules, at(4, 7, 0)).unwrap();
        assert_eq!(sunday_later.id, "sunday");
    }

    #[test]
    fn overnight_schedule_not_active_before_start() {
        let schedules = vec![temp("night", vec![DayOfWeek::Sat], "22:00", "07:00", 17.0)];
        assert!(find_active(&schedules, at(3, 21, 59)).is_none());
        // Saturday morning belongs to Friday, which is not configured.
        assert!(find_active(&schedules, at(3, 5, 0)).is_none());
    }

    #[test]
    fn empty_day_list_means_every_day() {
        let schedules = vec![temp("daily", Vec::new(), "08:00", "09:00", 20.0)];
        for day in 3..=9 {
            assert!(find_active(&schedules, at(day, 8, 30)).is_some());
        }
        assert!(find_active(&schedules, at(5, 9, 0)).is_none());
    }

    #[test]
    fn default_end_runs_to_midnight() {
        let schedule: Schedule = serde_json::from_str(
            r#"{"id":"evening","days":["mon"],"start_time":"18:00","temperature":20.5}"#,
        )
        .unwrap();
        assert_eq!(schedule.end_time, ClockTime::END_OF_DAY);
        assert!(schedule.enabled);

        let schedules = vec![schedule];
        assert!(find_active(&schedules, at(5, 23, 59)).is_some());
        assert!(find_active(&schedules, at(6, 0, 0)).is_none());
    }

    #[test]
    fn one_off_matches_exact_date_only() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let schedules = vec![
            temp("weekday", vec![DayOfWeek::Mon], "08:00", "17:00", 20.0),
            Schedule::one_off(
                "holiday",
                date,
                hm("10:00"),
                hm("12:00"),
                ScheduleTarget::Preset {
                    preset_mode: PresetMode::Comfort,
                },
            ),
        ];

        assert_eq!(find_active(&schedules, at(5, 11, 0)).unwrap().id, "holiday");
        assert_eq!(find_active(&schedules, at(5, 12, 0)).unwrap().id, "weekday");
        assert_eq!(find_active(&schedules, at(12, 11, 0)).unwrap().id, "weekday");
    }

    #[test]
    fn disabled_schedules_are_ignored() {
        let mut schedule = temp("off", Vec::new(), "00:00", "24:00", 20.0);
        schedule.enabled = false;
        assert!(find_active(&[schedule], at(5, 12, 0)).is_none());
    }

    #[test]
    fn rejects_malformed_times() {
        assert!("25:00".parse::<ClockTime>().is_err());
        assert!("12:60".parse::<ClockTime>().is_err());
        assert!("noon".parse::<ClockTime>().is_err());
        assert!("24:01".parse::<ClockTime>().is_err());
        assert_eq!("07:30:00".parse::<ClockTime>().unwrap(), hm("07:30"));
        assert_eq!(hm("24:00"), ClockTime::END_OF_DAY);
    }

    #[test]
    fn validation_rejects_bad_targets() {
        let hot = temp("hot", Vec::new(), "08:00", "09:00", 40.0);
        assert!(hot.validate().is_err());

        let boost = Schedule::recurring(
            "boost",
            Vec::new(),
            hm("08:00"),
            hm("09:00"),
            ScheduleTarget::Preset {
                preset_mode: PresetMode::Boost,
            },
        );
        assert!(boost.validate().is_err());

        let overnight_once = Schedule::one_off(
            "once",
            NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            hm("22:00"),
            hm("06:00"),
            ScheduleTarget::Temperature { temperature: 18.0 },
        );
        assert!(overnight_once.validate().is_err());
    }

    #[test]
    fn target_serializes_flat() {
        let schedule = Schedule::recurring(
            "eco",
            vec![DayOfWeek::Mon, DayOfWeek::Tue],
            hm("06:30"),
            hm("08:00"),
            ScheduleTarget::Preset {
                preset_mode: PresetMode::Eco,
            },
        );
        let value = serde_json::to_value(&schedule).unwrap();
        assert_eq!(value["preset_mode"], "eco");
        assert_eq!(value["start_time"], "06:30");
        assert!(value.get("temperature").is_none());

        let back: Schedule = serde_json::from_value(value).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn schedule_needs_exactly_one_target() {
        let both = serde_json::json!({
            "id": "x",
            "start_time": "06:00",
            "end_time": "08:00",
            "temperature": 21.0,
            "preset_mode": "eco",
        });
        let err = serde_json::from_value::<Schedule>(both).unwrap_err();
        assert!(err.to_string().contains("both"), "{err}");

        let neither = serde_json::json!({"id": "x", "start_time": "06:00", "end_time": "08:00"});
        assert!(serde_json::from_value::<Schedule>(neither).is_err());

        let temperature = serde_json::json!({
            "id": "x",
            "start_time": "06:00",
            "end_time": "08:00",
            "temperature": 21.0,
        });
        let schedule: Schedule = serde_json::from_value(temperature).unwrap();
        assert_eq!(
            schedule.target,
            ScheduleTarget::Temperature { temperature: 21.0 }
        );
    }

    #[test]
    fn finds_next_event_including_ends() {
        let schedules = vec![
            temp("morning", vec![DayOfWeek::Mon], "09:00", "12:00", 21.0),
            temp("evening", vec![DayOfWeek::Mon], "18:00", "22:00", 20.0),
        ];

        let next = next_event_epoch(&schedules, fixed_time(5, 9, 1)).unwrap();
        assert_eq!(next, fixed_time(5, 12, 0).timestamp());

        let next = next_event_epoch(&schedules, fixed_time(5, 12, 0)).unwrap();
        assert_eq!(next, fixed_time(5, 18, 0).timestamp());
    }

    #[test]
    fn next_event_wraps_to_following_week() {
        let schedules = vec![temp("night", vec![DayOfWeek::Sun], "23:00", "06:00", 17.0)];
        // Monday 08:00: next start is next Sunday 23:00.
        let next = next_event_epoch(&schedules, fixed_time(5, 8, 0)).unwrap();
        assert_eq!(next, fixed_time(11, 23, 0).timestamp());
    }
}
