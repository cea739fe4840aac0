//! One control cycle across every zone: effective target, protections,
//! hysteresis decision, device actuation and shared-boiler aggregation.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, FixedOffset, Utc};

use crate::{
    actuator::{Demand, DeviceActuator},
    config::{GlobalSettings, FROST_FLOOR_TEMP},
    heating_curve::HeatingCurve,
    ports::{Collaborators, EventCategory, ZoneEvent},
    schedule::ClockTime,
    scheduler::ScheduleOutcome,
    snapshot::{SensorSnapshot, WindowReading, ZoneReadings},
    types::{DeviceKind, HvacMode, PresetMode, TargetSource, ZoneState},
    zone::Zone,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    FrostFloor,
    VacationFloor,
}

impl Protection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FrostFloor => "frost_floor",
            Self::VacationFloor => "vacation_floor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetResolution {
    pub target: f32,
    pub source: TargetSource,
    pub protection: Option<Protection>,
}

/// An open learning-engine heating event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatingEventState {
    pub started_at: DateTime<Utc>,
    pub start_temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneOutcome {
    pub zone_id: String,
    pub previous: ZoneState,
    pub state: ZoneState,
    pub current: Option<f32>,
    pub target: f32,
    pub source: TargetSource,
    pub protection: Option<Protection>,
    pub actuation_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub zones: Vec<ZoneOutcome>,
    /// `None` when no zone is heating and the boiler was commanded off.
    pub boiler_setpoint: Option<f32>,
    pub boiler_failures: usize,
}

impl CycleReport {
    pub fn zone(&self, zone_id: &str) -> Option<&ZoneOutcome> {
        self.zones.iter().find(|outcome| outcome.zone_id == zone_id)
    }

    pub fn heating_zones(&self) -> impl Iterator<Item = &ZoneOutcome> {
        self.zones
            .iter()
            .filter(|outcome| outcome.state == ZoneState::Heating)
    }
}

/// Per-cycle inputs that do not belong to a single zone.
pub struct CycleContext<'a> {
    pub settings: &'a GlobalSettings,
    pub snapshot: &'a SensorSnapshot,
    pub schedules: &'a ScheduleOutcome,
    pub now: DateTime<FixedOffset>,
}

/// Hysteresis step. Inside `[target - h, target)` the previous decision holds.
/// Only `Heating` is carried through the dead band: a zone coming back from `Off`
/// or `Manual` lands in `Idle` there and waits for the lower threshold.
pub fn decide(previous: ZoneState, current: f32, target: f32, hysteresis: f32) -> ZoneState {
    if current < target - hysteresis {
        ZoneState::Heating
    } else if current >= target {
        ZoneState::Idle
    } else if previous == ZoneState::Heating {
        ZoneState::Heating
    } else {
        ZoneState::Idle
    }
}

/// Frost floor in force: a vacation override replaces the global one.
pub fn frost_floor(settings: &GlobalSettings, now: DateTime<FixedOffset>) -> Option<f32> {
    let vacation = &settings.vacation;
    if vacation.is_active(now.date_naive()) {
        if let Some(floor) = vacation.frost_protection_override {
            return Some(floor);
        }
    }
    settings
        .frost_protection
        .enabled
        .then_some(settings.frost_protection.min_temperature)
}

/// Effective target for a zone. Pure given its inputs.
pub fn resolve_target(
    zone: &Zone,
    settings: &GlobalSettings,
    readings: &ZoneReadings,
    schedule_temperature: Option<f32>,
    preheat: Option<f32>,
    now: DateTime<FixedOffset>,
) -> TargetResolution {
    let (mut target, source) = if zone.is_boost_active(now.with_timezone(&Utc)) {
        (zone.boost.temperature, TargetSource::Boost)
    } else if let Some(window) = readings.window {
        let target = match window {
            WindowReading::TurnOff => FROST_FLOOR_TEMP,
            WindowReading::Reduce { temp_drop } => {
                (zone.base_target_temperature - temp_drop).max(FROST_FLOOR_TEMP)
            }
        };
        (target, TargetSource::Window)
    } else {
        let preset = match zone.preset_mode {
            PresetMode::None | PresetMode::Boost => None,
            preset => zone.preset_temperature(preset, settings),
        };
        let (mut target, source) = match (preset, schedule_temperature) {
            (Some(target), _) => (target, TargetSource::Preset),
            (None, Some(target)) => (target, TargetSource::Schedule),
            (None, None) => (zone.base_target_temperature, TargetSource::Base),
        };
        // The vacation preset replaces the chain's pick; night boost and preheat still apply on top.
        if let Some(temperature) = vacation_preset_temperature(zone, settings, now) {
            target = temperature;
        }
        let offset = if zone.night_boost.is_active_at(ClockTime::of(&now)) {
            zone.night_boost.offset
        } else {
            0.0
        };
        (target + offset, source)
    };

    let mut protection = None;
    let overridable = !matches!(source, TargetSource::Boost | TargetSource::Window);

    if overridable {
        if let Some(wake) = preheat {
            target = target.max(wake);
        }
    }

    let vacation = &settings.vacation;
    if overridable && vacation.is_active(now.date_naive()) {
        if let Some(min) = vacation.min_temperature {
            if target < min {
                target = min;
                protection = Some(Protection::VacationFloor);
            }
        }
    }

    if let Some(floor) = frost_floor(settings, now) {
        if target < floor {
            target = floor;
            protection = Some(Protection::FrostFloor);
        }
    }

    TargetResolution {
        target,
        source,
        protection,
    }
}

fn vacation_preset_temperature(
    zone: &Zone,
    settings: &GlobalSettings,
    now: DateTime<FixedOffset>,
) -> Option<f32> {
    let vacation = &settings.vacation;
    if !vacation.is_active(now.date_naive()) {
        return None;
    }
    vacation
        .preset_mode
        .and_then(|preset| zone.preset_temperature(preset, settings))
}

#[derive(Debug, Clone)]
pub struct ZoneControlEngine {
    states: HashMap<String, ZoneState>,
    heating_events: HashMap<String, HeatingEventState>,
    protections: HashMap<String, Protection>,
    actuator: DeviceActuator,
}

impl ZoneControlEngine {
    pub fn new(deadband: f32) -> Self {
        Self {
            states: HashMap::new(),
            heating_events: HashMap::new(),
            protections: HashMap::new(),
            actuator: DeviceActuator::new(deadband),
        }
    }

    pub fn state(&self, zone_id: &str) -> ZoneState {
        self.states.get(zone_id).copied().unwrap_or_default()
    }

    pub fn heating_event(&self, zone_id: &str) -> Option<&HeatingEventState> {
        self.heating_events.get(zone_id)
    }

    pub fn actuator_mut(&mut self) -> &mut DeviceActuator {
        &mut self.actuator
    }

    pub fn forget_zone(&mut self, zone_id: &str) {
        self.states.remove(zone_id);
        self.heating_events.remove(zone_id);
        self.protections.remove(zone_id);
    }

    pub fn run_cycle<'z>(
        &mut self,
        zones: impl IntoIterator<Item = &'z mut Zone>,
        context: &CycleContext<'_>,
        curve: &mut HeatingCurve,
        collaborators: Collaborators<'_>,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        let mut gateways = BTreeSet::new();

        for zone in zones {
            gateways.extend(zone.entities_of(DeviceKind::OpenthermGateway));
            let outcome = self.run_zone(zone, context, collaborators);
            report.zones.push(outcome);
        }

        if let Some(entity) = context.settings.boiler.entity_id.as_deref() {
            gateways.insert(entity.to_string());
        }

        let max_target = report
            .heating_zones()
            .map(|outcome| outcome.target)
            .fold(None, |max: Option<f32>, target| {
                Some(max.map_or(target, |max| max.max(target)))
            });
        report.boiler_setpoint = max_target.map(|target| boiler_setpoint(target, context, curve));

        for entity in &gateways {
            match self
                .actuator
                .set_boiler(collaborators.store, entity, report.boiler_setpoint)
            {
                Ok(true) => {
                    tracing::info!(entity = %entity, setpoint = ?report.boiler_setpoint, "boiler commanded")
                }
                Ok(false) => {}
                Err(err) => {
                    report.boiler_failures += 1;
                    tracing::warn!(entity = %entity, "boiler command failed: {err}");
                }
            }
        }

        report
    }

    fn run_zone(
        &mut self,
        zone: &mut Zone,
        context: &CycleContext<'_>,
        collaborators: Collaborators<'_>,
    ) -> ZoneOutcome {
        let settings = context.settings;
        let readings = context.snapshot.zone(&zone.id);
        let now_utc = context.now.with_timezone(&Utc);
        zone.current_temperature = readings.current;

        if zone.auto_preset_enabled && !zone.is_boost_active(now_utc) {
            if let Some(present) = readings.presence {
                let preset = if present {
                    zone.auto_preset_home
                } else {
                    zone.auto_preset_away
                };
                if zone.preset_mode != preset {
                    tracing::info!(zone = %zone.id, preset = %preset, "presence changed preset");
                    zone.preset_mode = preset;
                }
            }
        }

        let schedule_temperature = context
            .schedules
            .active
            .get(&zone.id)
            .and_then(|active| active.temperature);
        let preheat = context.schedules.preheat.get(&zone.id).copied();
        let resolution = resolve_target(
            zone,
            settings,
            &readings,
            schedule_temperature,
            preheat,
            context.now,
        );

        let previous = self.state(&zone.id);
        let state = if !zone.enabled || zone.hvac_mode == HvacMode::Off {
            ZoneState::Off
        } else if zone.manual_override {
            ZoneState::Manual
        } else {
            match readings.current {
                Some(current) => {
                    let forced = preheat
                        .map(|wake| resolution.source != TargetSource::Boost && current < wake)
                        .unwrap_or(false)
                        && resolution.source != TargetSource::Window;
                    if forced {
                        ZoneState::Heating
                    } else {
                        decide(previous, current, resolution.target, zone.hysteresis(settings))
                    }
                }
                None => {
                    tracing::debug!(zone = %zone.id, "no temperature reading, idling");
                    ZoneState::Idle
                }
            }
        };

        self.track_transition(zone, previous, state, &readings, &resolution, context, collaborators);

        let actuation_failures =
            self.actuate(zone, state, resolution.target, &readings, context, collaborators);

        ZoneOutcome {
            zone_id: zone.id.clone(),
            previous,
            state,
            current: readings.current,
            target: resolution.target,
            source: resolution.source,
            protection: resolution.protection,
            actuation_failures,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn track_transition(
        &mut self,
        zone: &Zone,
        previous: ZoneState,
        state: ZoneState,
        readings: &ZoneReadings,
        resolution: &TargetResolution,
        context: &CycleContext<'_>,
        collaborators: Collaborators<'_>,
    ) {
        self.states.insert(zone.id.clone(), state);

        if state != previous {
            tracing::info!(
                zone = %zone.id,
                from = previous.as_str(),
                to = state.as_str(),
                target = resolution.target,
                current = ?readings.current,
                "zone state changed"
            );
            collaborators.events.emit(
                &ZoneEvent::new(
                    &zone.id,
                    EventCategory::StateChange,
                    format!("{} -> {}", previous.as_str(), state.as_str()),
                )
                .field("target", resolution.target)
                .field("current", readings.current),
            );
        }

        match (previous == ZoneState::Heating, state == ZoneState::Heating) {
            (false, true) => {
                if let Some(current) = readings.current {
                    collaborators.learning.start_heating_event(&zone.id, current);
                    self.heating_events.insert(
                        zone.id.clone(),
                        HeatingEventState {
                            started_at: context.now.with_timezone(&Utc),
                            start_temperature: current,
                        },
                    );
                }
            }
            (true, false) => {
                if self.heating_events.remove(&zone.id).is_some() {
                    if let Some(current) = readings.current {
                        collaborators.learning.end_heating_event(&zone.id, current);
                    }
                }
            }
            _ => {}
        }

        match resolution.protection {
            Some(protection) => {
                if self.protections.insert(zone.id.clone(), protection) != Some(protection) {
                    tracing::info!(zone = %zone.id, protection = protection.as_str(), "protection active");
                    collaborators.events.emit(
                        &ZoneEvent::new(&zone.id, EventCategory::Protection, protection.as_str())
                            .field("target", resolution.target),
                    );
                }
            }
            None => {
                self.protections.remove(&zone.id);
            }
        }
    }

    /// Drive every device in the zone. Returns how many commands failed.
    fn actuate(
        &mut self,
        zone: &Zone,
        state: ZoneState,
        target: f32,
        readings: &ZoneReadings,
        context: &CycleContext<'_>,
        collaborators: Collaborators<'_>,
    ) -> usize {
        let store = collaborators.store;
        let settings = context.settings;
        let floor = frost_floor(settings, context.now).unwrap_or(FROST_FLOOR_TEMP);
        let mut failures = 0;

        let mut record = |entity: &str, result: crate::error::Result<bool>| match result {
            Ok(sent) => {
                if sent {
                    tracing::debug!(zone = %zone.id, entity, "device commanded");
                }
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(zone = %zone.id, entity, "actuation failed: {err}");
                collaborators.events.emit(
                    &ZoneEvent::new(&zone.id, EventCategory::Actuation, err.to_string())
                        .field("entity", entity),
                );
            }
        };

        if state != ZoneState::Manual {
            for entity in zone.entities_of(DeviceKind::Thermostat) {
                let result = match state {
                    ZoneState::Off => self.actuator.turn_off_thermostat(store, &entity, floor),
                    _ => self.actuator.set_thermostat_temperature(store, &entity, target),
                };
                record(&entity, result);
            }

            let demand = if state == ZoneState::Heating {
                Demand::Heat
            } else {
                Demand::Idle
            };
            for entity in zone.entities_of(DeviceKind::Valve) {
                let result = self
                    .actuator
                    .drive_valve(store, &entity, demand, target, &settings.trv);
                record(&entity, result);
            }
        }

        let switch_on = match state {
            ZoneState::Heating => true,
            ZoneState::Manual => readings.thermostat_heating,
            ZoneState::Idle => !zone.shutdown_switches_when_idle || readings.thermostat_heating,
            ZoneState::Off => readings.thermostat_heating,
        };
        for entity in zone.entities_of(DeviceKind::Switch) {
            if state != ZoneState::Heating && switch_on && readings.thermostat_heating {
                tracing::debug!(zone = %zone.id, entity = %entity, "thermostat still heating, keeping switch on");
            }
            let result = self.actuator.set_switch(store, &entity, switch_on);
            record(&entity, result);
        }

        failures
    }
}

fn boiler_setpoint(max_target: f32, context: &CycleContext<'_>, curve: &mut HeatingCurve) -> f32 {
    let boiler = &context.settings.boiler;
    let mut setpoint = match context.snapshot.outdoor {
        Some(outdoor) if boiler.heating_curve.enabled => {
            curve.set_system(boiler.heating_curve.system);
            curve.update(max_target, outdoor)
        }
        _ => max_target + boiler.overhead,
    };
    if let Some(return_temp) = context.snapshot.boiler_return {
        let minimum = return_temp + boiler.min_return_margin;
        if setpoint < minimum {
            tracing::debug!(setpoint, minimum, "boiler setpoint raised to return floor");
            setpoint = minimum;
        }
    }
    setpoint
}
