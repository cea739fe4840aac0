//! Applies the active schedule entry to each zone and flags predictive pre-heating.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, FixedOffset, Utc};

use crate::{
    config::GlobalSettings,
    ports::{EventCategory, EventSink, LearningEngine, ZoneEvent},
    schedule::{find_active, ClockTime, DayOfWeek, Schedule, ScheduleTarget},
    snapshot::ZoneReadings,
    types::PresetMode,
    zone::Zone,
};

/// Schedule in force for a zone this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSchedule {
    pub schedule_id: String,
    /// Raw temperature of the entry, unless a manual change superseded it.
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    pub active: HashMap<String, ActiveSchedule>,
    /// Zones that should start heating now to reach this temperature by wake time.
    pub preheat: HashMap<String, f32>,
    pub changed_zones: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScheduleEvaluator {
    last_applied: HashMap<String, String>,
    superseded: HashSet<String>,
    preheating: HashSet<String>,
    margin_minutes: u32,
}

impl ScheduleEvaluator {
    pub fn new(margin_minutes: u32) -> Self {
        Self {
            last_applied: HashMap::new(),
            superseded: HashSet::new(),
            preheating: HashSet::new(),
            margin_minutes,
        }
    }

    pub fn set_margin_minutes(&mut self, margin_minutes: u32) {
        self.margin_minutes = margin_minutes;
    }

    pub fn last_applied(&self, zone_id: &str) -> Option<&str> {
        self.last_applied.get(zone_id).map(String::as_str)
    }

    /// Forget what was applied so the next evaluation re-applies. Call on schedule edits.
    pub fn invalidate(&mut self, zone_id: &str) {
        self.last_applied.remove(zone_id);
        self.superseded.remove(zone_id);
    }

    /// A manual target change outranks the running entry until the next transition.
    pub fn supersede(&mut self, zone_id: &str) {
        if self.last_applied.contains_key(zone_id) {
            self.superseded.insert(zone_id.to_string());
        }
    }

    pub fn remove_zone(&mut self, zone_id: &str) {
        self.invalidate(zone_id);
        self.preheating.remove(zone_id);
    }

    pub fn evaluate<'z>(
        &mut self,
        zones: impl IntoIterator<Item = &'z mut Zone>,
        settings: &GlobalSettings,
        readings: &HashMap<String, ZoneReadings>,
        now: DateTime<FixedOffset>,
        learning: &dyn LearningEngine,
        events: &dyn EventSink,
    ) -> ScheduleOutcome {
        let mut outcome = ScheduleOutcome::default();
        let local = now.naive_local();

        for zone in zones {
            if !zone.enabled {
                continue;
            }

            match find_active(&zone.schedules, local).cloned() {
                Some(schedule) => {
                    if self.last_applied(&zone.id) != Some(schedule.id.as_str()) {
                        self.superseded.remove(&zone.id);
                        apply(zone, &schedule, settings, now.with_timezone(&Utc));
                        self.last_applied
                            .insert(zone.id.clone(), schedule.id.clone());
                        outcome.changed_zones.push(zone.id.clone());
                        tracing::info!(zone = %zone.id, schedule = %schedule.id, "schedule applied");
                        events.emit(
                            &ZoneEvent::new(
                                &zone.id,
                                EventCategory::ScheduleApplied,
                                format!("schedule {} applied", schedule.id),
                            )
                            .field("schedule_id", schedule.id.clone())
                            .field("base_target", zone.base_target_temperature),
                        );
                    }

                    let temperature = match schedule.target {
                        ScheduleTarget::Temperature { temperature }
                            if !self.superseded.contains(&zone.id) =>
                        {
                            Some(temperature)
                        }
                        _ => None,
                    };
                    outcome.active.insert(
                        zone.id.clone(),
                        ActiveSchedule {
                            schedule_id: schedule.id,
                            temperature,
                        },
                    );
                }
                None => {
                    if self.last_applied.remove(&zone.id).is_some() {
                        tracing::debug!(zone = %zone.id, "schedule window ended");
                    }
                    self.superseded.remove(&zone.id);
                }
            }

            let zone_readings = readings.get(&zone.id).cloned().unwrap_or_default();
            match self.smart_preheat(zone, settings, &zone_readings, now, learning) {
                Some(target) => {
                    if self.preheating.insert(zone.id.clone()) {
                        tracing::info!(zone = %zone.id, target, "smart night boost pre-heating");
                        events.emit(
                            &ZoneEvent::new(&zone.id, EventCategory::Preheat, "pre-heat started")
                                .field("target", target),
                        );
                    }
                    outcome.preheat.insert(zone.id.clone(), target);
                }
                None => {
                    self.preheating.remove(&zone.id);
                }
            }
        }

        outcome
    }

    fn smart_preheat(
        &self,
        zone: &Zone,
        settings: &GlobalSettings,
        readings: &ZoneReadings,
        now: DateTime<FixedOffset>,
        learning: &dyn LearningEngine,
    ) -> Option<f32> {
        if !zone.smart_night_boost.enabled {
            return None;
        }
        let current = readings.current?;
        let local = now.naive_local();
        let today = local.date();

        let (wake_time, target) = wake_target(zone, settings, now)?;
        let wake_at = wake_time.on(today)?;
        if local >= wake_at || current >= target {
            return None;
        }

        let minutes = learning.predict_heating_minutes(&zone.id, current, target, readings.outdoor)?;
        let lead = Duration::minutes(i64::from(minutes) + i64::from(self.margin_minutes));
        let optimal_start = wake_at - lead;

        (local >= optimal_start).then_some(target)
    }
}

/// Earliest morning entry today, else the configured fixed wake time at base target.
fn wake_target(
    zone: &Zone,
    settings: &GlobalSettings,
    now: DateTime<FixedOffset>,
) -> Option<(ClockTime, f32)> {
    let today = now.naive_local().date();
    let day = DayOfWeek::from_chrono(chrono::Datelike::weekday(&today));

    let morning = zone
        .schedules
        .iter()
        .filter(|schedule| schedule.enabled)
        .filter(|schedule| match schedule.date {
            Some(date) => date == today,
            None => schedule.applies_on(day),
        })
        .filter(|schedule| schedule.start_time.hour() < 12)
        .min_by_key(|schedule| schedule.start_time);

    if let Some(schedule) = morning {
        let target = match schedule.target {
            ScheduleTarget::Temperature { temperature } => Some(temperature),
            ScheduleTarget::Preset { preset_mode } => zone.preset_temperature(preset_mode, settings),
        };
        return target.map(|target| (schedule.start_time, target));
    }

    Some((
        zone.smart_night_boost.target_time,
        zone.base_target_temperature,
    ))
}

fn apply(zone: &mut Zone, schedule: &Schedule, settings: &GlobalSettings, now: DateTime<Utc>) {
    let boosting = zone.is_boost_active(now);
    match schedule.target {
        ScheduleTarget::Preset { preset_mode } => {
            if let Some(temperature) = zone.preset_temperature(preset_mode, settings) {
                zone.base_target_temperature = temperature;
            }
            if !boosting {
                zone.preset_mode = preset_mode;
            }
        }
        ScheduleTarget::Temperature { temperature } => {
            zone.base_target_temperature = temperature;
            if !boosting {
                zone.preset_mode = PresetMode::None;
            }
        }
    }
    zone.manual_override = false;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::testing::{FixedLearning, RecordingEvents};
    use crate::ports::NoLearning;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn hm(value: &str) -> ClockTime {
        value.parse().unwrap()
    }

    fn zone_with(schedules: Vec<Schedule>) -> Zone {
        let mut zone = Zone::new("bedroom", "Bedroom");
        zone.schedules = schedules;
        zone
    }

    fn readings(zone: &str, current: f32) -> HashMap<String, ZoneReadings> {
        HashMap::from([(
            zone.to_string(),
            ZoneReadings {
                current: Some(current),
                ..ZoneReadings::default()
            },
        )])
    }

    #[test]
    fn applies_once_per_transition() {
        let mut zone = zone_with(vec![Schedule::recurring(
            "morning",
            Vec::new(),
            hm("06:00"),
            hm("09:00"),
            ScheduleTarget::Temperature { temperature: 21.0 },
        )]);
        zone.manual_override = true;
        let settings = GlobalSettings::default();
        let events = RecordingEvents::default();
        let mut evaluator = ScheduleEvaluator::new(10);

        let first = evaluator.evaluate(
            [&mut zone],
            &settings,
            &HashMap::new(),
            at(5, 6, 0),
            &NoLearning,
            &events,
        );
        assert_eq!(first.changed_zones, vec!["bedroom".to_string()]);
        assert_eq!(zone.base_target_temperature, 21.0);
        assert!(!zone.manual_override);

        // A manual change inside the same window is not overwritten.
        zone.base_target_temperature = 19.0;
        evaluator.supersede("bedroom");
        let second = evaluator.evaluate(
            [&mut zone],
            &settings,
            &HashMap::new(),
            at(5, 6, 1),
            &NoLearning,
            &events,
        );
        assert!(second.changed_zones.is_empty());
        assert_eq!(zone.base_target_temperature, 19.0);
        assert_eq!(second.active["bedroom"].temperature, None);

        // Editing the schedule set forces re-application.
        evaluator.invalidate("bedroom");
        let third = evaluator.evaluate(
            [&mut zone],
            &settings,
            &HashMap::new(),
            at(5, 6, 2),
            &NoLearning,
            &events,
        );
        assert_eq!(third.changed_zones.len(), 1);
        assert_eq!(zone.base_target_temperature, 21.0);
        assert_eq!(events.events().len(), 2);
    }

    #[test]
    fn preset_entry_sets_preset_and_base() {
        let mut zone = zone_with(vec![Schedule::recurring(
            "evening",
            Vec::new(),
            hm("18:00"),
            hm("23:00"),
            ScheduleTarget::Preset {
                preset_mode: PresetMode::Comfort,
            },
        )]);
        let mut evaluator = ScheduleEvaluator::new(10);

        let outcome = evaluator.evaluate(
            [&mut zone],
            &GlobalSettings::default(),
            &HashMap::new(),
            at(5, 19, 0),
            &NoLearning,
            &RecordingEvents::default(),
        );
        assert_eq!(zone.preset_mode, PresetMode::Comfort);
        assert_eq!(zone.base_target_temperature, 22.0);
        assert_eq!(outcome.active["bedroom"].schedule_id, "evening");
        assert_eq!(evaluator.last_applied("bedroom"), Some("evening"));
    }

    #[test]
    fn schedule_does_not_cancel_running_boost() {
        let mut zone = zone_with(vec![Schedule::recurring(
            "eco",
            Vec::new(),
            hm("00:00"),
            hm("24:00"),
            ScheduleTarget::Preset {
                preset_mode: PresetMode::Eco,
            },
        )]);
        let now = at(5, 12, 0);
        zone.set_boost(26.0, 30, now.with_timezone(&Utc));
        let mut evaluator = ScheduleEvaluator::new(10);

        evaluator.evaluate(
            [&mut zone],
            &GlobalSettings::default(),
            &HashMap::new(),
            now,
            &NoLearning,
            &RecordingEvents::default(),
        );
        assert_eq!(zone.preset_mode, PresetMode::Boost);
        assert_eq!(zone.base_target_temperature, 18.0);
    }

    #[test]
    fn smart_boost_starts_inside_predicted_window() {
        let mut zone = zone_with(vec![Schedule::recurring(
            "wake",
            Vec::new(),
            hm("07:00"),
            hm("09:00"),
            ScheduleTarget::Temperature { temperature: 21.0 },
        )]);
        zone.smart_night_boost.enabled = true;
        let learning = FixedLearning::predicting(50);
        let mut evaluator = ScheduleEvaluator::new(10);
        let settings = GlobalSettings::default();
        let events = RecordingEvents::default();
        let readings = readings("bedroom", 17.0);

        // 07:00 - 50min - 10min = 06:00.
        let early = evaluator.evaluate(
            [&mut zone],
            &settings,
            &readings,
            at(5, 5, 59),
            &learning,
            &events,
        );
        assert!(early.preheat.is_empty());

        let on_time = evaluator.evaluate(
            [&mut zone],
            &settings,
            &readings,
            at(5, 6, 0),
            &learning,
            &events,
        );
        assert_eq!(on_time.preheat.get("bedroom"), Some(&21.0));

        let after_wake = evaluator.evaluate(
            [&mut zone],
            &settings,
            &readings,
            at(5, 7, 0),
            &learning,
            &events,
        );
        assert!(after_wake.preheat.is_empty());
    }

    #[test]
    fn smart_boost_without_prediction_does_nothing() {
        let mut zone = Zone::new("bedroom", "Bedroom");
        zone.smart_night_boost.enabled = true;
        zone.smart_night_boost.target_time = hm("06:30");
        let mut evaluator = ScheduleEvaluator::new(10);

        let outcome = evaluator.evaluate(
            [&mut zone],
            &GlobalSettings::default(),
            &readings("bedroom", 15.0),
            at(5, 6, 0),
            &NoLearning,
            &RecordingEvents::default(),
        );
        assert!(outcome.preheat.is_empty());
    }

    #[test]
    fn smart_boost_falls_back_to_fixed_wake_time() {
        let mut zone = Zone::new("bedroom", "Bedroom");
        zone.base_target_temperature = 20.0;
        zone.smart_night_boost.enabled = true;
        zone.smart_night_boost.target_time = hm("06:30");
        let mut evaluator = ScheduleEvaluator::new(10);

        let outcome = evaluator.evaluate(
            [&mut zone],
            &GlobalSettings::default(),
            &readings("bedroom", 15.0),
            at(5, 6, 0),
            &FixedLearning::predicting(30),
            &RecordingEvents::default(),
        );
        assert_eq!(outcome.preheat.get("bedroom"), Some(&20.0));
    }
}
