//! Everything one heating installation owns, driven one cycle at a time.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ControllerConfig, GlobalSettings},
    engine::{CycleContext, CycleReport, ZoneControlEngine},
    error::{HeatingError, Result},
    heating_curve::{HeatingCurve, HeatingCurveState},
    ports::{Collaborators, EventCategory, ZoneEvent},
    registry::ZoneRegistry,
    schedule::{next_event_epoch, Schedule},
    scheduler::{ScheduleEvaluator, ScheduleOutcome},
    snapshot::SensorSnapshot,
    types::{HvacMode, PresetMode, TargetSource, ZoneStatus},
    zone::{DeviceEntry, NightBoost, PresenceSensor, SmartNightBoost, WindowSensor, Zone},
};

/// A user mutation of one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ZoneCommand {
    Create {
        name: String,
    },
    Delete,
    Rename {
        name: String,
    },
    SetHidden {
        hidden: bool,
    },
    SetTarget {
        temperature: f32,
    },
    SetHvacMode {
        hvac_mode: HvacMode,
    },
    SetEnabled {
        enabled: bool,
    },
    SetPreset {
        preset_mode: PresetMode,
    },
    SetPresetTemperature {
        preset_mode: PresetMode,
        temperature: f32,
    },
    StartBoost {
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        duration_minutes: Option<u32>,
    },
    CancelBoost,
    SetHysteresis {
        hysteresis: Option<f32>,
    },
    SetManualOverride {
        manual_override: bool,
    },
    SetPrimarySensor {
        entity_id: Option<String>,
    },
    SetShutdownSwitchesWhenIdle {
        shutdown: bool,
    },
    /// Creates the zone when it does not exist yet.
    AssignDevice {
        device_id: String,
        #[serde(flatten)]
        entry: DeviceEntry,
    },
    RemoveDevice {
        device_id: String,
    },
    AddSchedule {
        schedule: Schedule,
    },
    RemoveSchedule {
        schedule_id: String,
    },
    ReplaceSchedules {
        schedules: Vec<Schedule>,
    },
    SetScheduleEnabled {
        schedule_id: String,
        enabled: bool,
    },
    SetNightBoost {
        night_boost: NightBoost,
    },
    SetSmartNightBoost {
        smart_night_boost: SmartNightBoost,
    },
    AddWindowSensor {
        sensor: WindowSensor,
    },
    RemoveWindowSensor {
        sensor_id: String,
    },
    AddPresenceSensor {
        sensor: PresenceSensor,
    },
    RemovePresenceSensor {
        sensor_id: String,
    },
    SetPresenceOptions {
        use_global_presence: bool,
        #[serde(default)]
        auto_preset: Option<(PresetMode, PresetMode)>,
    },
}

impl ZoneCommand {
    fn touches_schedules(&self) -> bool {
        matches!(
            self,
            Self::AddSchedule { .. }
                | Self::RemoveSchedule { .. }
                | Self::ReplaceSchedules { .. }
                | Self::SetScheduleEnabled { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct HeatingSystem {
    registry: ZoneRegistry,
    settings: GlobalSettings,
    config: ControllerConfig,
    evaluator: ScheduleEvaluator,
    engine: ZoneControlEngine,
    curve: HeatingCurve,
    last_snapshot: SensorSnapshot,
    last_schedules: ScheduleOutcome,
    last_report: Option<CycleReport>,
}

impl HeatingSystem {
    pub fn new(
        config: ControllerConfig,
        mut settings: GlobalSettings,
        zones: Vec<Zone>,
        curve: &HeatingCurveState,
    ) -> Result<Self> {
        settings.sanitize();
        let registry = ZoneRegistry::from_zones(zones)?;
        Ok(Self {
            registry,
            evaluator: ScheduleEvaluator::new(config.smart_boost_margin_minutes),
            engine: ZoneControlEngine::new(config.thermostat_setpoint_deadband_c),
            curve: HeatingCurve::restore(settings.boiler.heating_curve.system, curve),
            settings,
            config,
            last_snapshot: SensorSnapshot::default(),
            last_schedules: ScheduleOutcome::default(),
            last_report: None,
        })
    }

    pub fn registry(&self) -> &ZoneRegistry {
        &self.registry
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.registry.to_vec()
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn curve(&self) -> &HeatingCurve {
        &self.curve
    }

    pub fn curve_state(&self) -> HeatingCurveState {
        self.curve.state()
    }

    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    pub fn update_settings(&mut self, mut settings: GlobalSettings) {
        settings.sanitize();
        self.curve.set_system(settings.boiler.heating_curve.system);
        self.settings = settings;
    }

    pub fn update_config(&mut self, config: ControllerConfig) {
        self.engine
            .actuator_mut()
            .set_deadband(config.thermostat_setpoint_deadband_c);
        self.evaluator
            .set_margin_minutes(config.smart_boost_margin_minutes);
        self.config = config;
    }

    /// One full control cycle. Callers serialize cycles.
    pub fn tick(&mut self, now: DateTime<FixedOffset>, collaborators: Collaborators<'_>) -> CycleReport {
        let now_utc = now.with_timezone(&Utc);

        for zone in self.registry.zones_mut() {
            if zone.expire_boost(now_utc) {
                tracing::info!(zone = %zone.id, "boost expired");
                collaborators
                    .events
                    .emit(&ZoneEvent::new(&zone.id, EventCategory::Boost, "boost expired"));
            }
        }

        let snapshot = SensorSnapshot::capture(
            self.registry.zones(),
            &self.settings,
            &self.config,
            collaborators.store,
            now_utc,
        );

        let schedules = self.evaluator.evaluate(
            self.registry.zones_mut(),
            &self.settings,
            &snapshot.zones,
            now,
            collaborators.learning,
            collaborators.events,
        );

        let context = CycleContext {
            settings: &self.settings,
            snapshot: &snapshot,
            schedules: &schedules,
            now,
        };
        let report = self.engine.run_cycle(
            self.registry.zones_mut(),
            &context,
            &mut self.curve,
            collaborators,
        );

        tracing::debug!(
            zones = report.zones.len(),
            heating = report.heating_zones().count(),
            boiler = ?report.boiler_setpoint,
            "cycle complete"
        );

        self.last_snapshot = snapshot;
        self.last_schedules = schedules;
        self.last_report = Some(report.clone());
        report
    }

    pub fn apply(&mut self, zone_id: &str, command: ZoneCommand, now: DateTime<Utc>) -> Result<()> {
        let invalidate = command.touches_schedules();
        let registry = &mut self.registry;

        match command {
            ZoneCommand::Create { name } => {
                registry.create_zone(zone_id, &name)?;
            }
            ZoneCommand::Delete => {
                let zone = registry.delete_zone(zone_id)?;
                self.evaluator.remove_zone(zone_id);
                self.engine.forget_zone(zone_id);
                for (device_id, entry) in &zone.devices {
                    self.engine.actuator_mut().forget(entry.entity(device_id));
                }
            }
            ZoneCommand::Rename { name } => registry.rename_zone(zone_id, &name)?,
            ZoneCommand::SetHidden { hidden } => registry.set_hidden(zone_id, hidden)?,
            ZoneCommand::SetTarget { temperature } => {
                registry.set_target_temperature(zone_id, temperature)?;
                self.evaluator.supersede(zone_id);
            }
            ZoneCommand::SetHvacMode { hvac_mode } => registry.set_hvac_mode(zone_id, hvac_mode)?,
            ZoneCommand::SetEnabled { enabled } => registry.set_enabled(zone_id, enabled)?,
            ZoneCommand::SetPreset { preset_mode } => {
                registry.set_preset_mode(zone_id, preset_mode)?
            }
            ZoneCommand::SetPresetTemperature {
                preset_mode,
                temperature,
            } => registry.set_preset_temperature(zone_id, preset_mode, temperature)?,
            ZoneCommand::StartBoost {
                temperature,
                duration_minutes,
            } => {
                let temperature = temperature.unwrap_or(self.settings.presets.boost);
                let minutes = duration_minutes.unwrap_or(self.config.boost_default_minutes);
                registry.set_boost(zone_id, temperature, minutes, now)?;
            }
            ZoneCommand::CancelBoost => {
                registry.cancel_boost(zone_id)?;
            }
            ZoneCommand::SetHysteresis { hysteresis } => {
                registry.set_hysteresis_override(zone_id, hysteresis)?
            }
            ZoneCommand::SetManualOverride { manual_override } => {
                registry.set_manual_override(zone_id, manual_override)?
            }
            ZoneCommand::SetPrimarySensor { entity_id } => {
                registry.set_primary_sensor(zone_id, entity_id)?
            }
            ZoneCommand::SetShutdownSwitchesWhenIdle { shutdown } => {
                registry.set_shutdown_switches_when_idle(zone_id, shutdown)?
            }
            ZoneCommand::AssignDevice { device_id, entry } => {
                let zone_id = zone_id.trim();
                let entity = entry.entity(&device_id).to_string();
                let created = registry.ensure_zone(zone_id, zone_id)?;
                if let Err(err) = registry.assign_device(zone_id, &device_id, entry) {
                    if created {
                        registry.delete_zone(zone_id)?;
                    }
                    return Err(err);
                }
                if created {
                    tracing::info!(zone = zone_id, device = %device_id, "zone auto-created for device");
                }
                self.engine.actuator_mut().forget(&entity);
            }
            ZoneCommand::RemoveDevice { device_id } => {
                let entry = registry.remove_device(zone_id, &device_id)?;
                self.engine.actuator_mut().forget(entry.entity(&device_id));
            }
            ZoneCommand::AddSchedule { schedule } => registry.add_schedule(zone_id, schedule)?,
            ZoneCommand::RemoveSchedule { schedule_id } => {
                registry.remove_schedule(zone_id, &schedule_id)?;
            }
            ZoneCommand::ReplaceSchedules { schedules } => {
                registry.replace_schedules(zone_id, schedules)?
            }
            ZoneCommand::SetScheduleEnabled {
                schedule_id,
                enabled,
            } => registry.set_schedule_enabled(zone_id, &schedule_id, enabled)?,
            ZoneCommand::SetNightBoost { night_boost } => {
                registry.set_night_boost(zone_id, night_boost)?
            }
            ZoneCommand::SetSmartNightBoost { smart_night_boost } => {
                registry.set_smart_night_boost(zone_id, smart_night_boost)?
            }
            ZoneCommand::AddWindowSensor { sensor } => registry.add_window_sensor(zone_id, sensor)?,
            ZoneCommand::RemoveWindowSensor { sensor_id } => {
                registry.remove_window_sensor(zone_id, &sensor_id)?
            }
            ZoneCommand::AddPresenceSensor { sensor } => {
                registry.add_presence_sensor(zone_id, sensor)?
            }
            ZoneCommand::RemovePresenceSensor { sensor_id } => {
                registry.remove_presence_sensor(zone_id, &sensor_id)?
            }
            ZoneCommand::SetPresenceOptions {
                use_global_presence,
                auto_preset,
            } => registry.set_presence_options(zone_id, use_global_presence, auto_preset)?,
        }

        if invalidate {
            self.evaluator.invalidate(zone_id);
        }
        Ok(())
    }

    /// Feed a boiler setpoint the user found comfortable into the curve autotuner.
    /// Returns the new optimal coefficient, if the setpoint was usable.
    pub fn confirm_boiler_setpoint(&mut self, setpoint: f32) -> Result<Option<f32>> {
        let outdoor = self.last_snapshot.outdoor.ok_or_else(|| {
            HeatingError::SensorUnavailable("no outdoor temperature for autotune".to_string())
        })?;
        let target = self
            .last_report
            .as_ref()
            .and_then(|report| {
                report
                    .heating_zones()
                    .map(|outcome| outcome.target)
                    .reduce(f32::max)
            })
            .ok_or_else(|| HeatingError::validation("no zone is heating"))?;

        let optimal = self.curve.autotune(setpoint, target, outdoor);
        if let Some(coefficient) = optimal {
            self.curve.set_coefficient(coefficient);
            tracing::info!(setpoint, target, outdoor, coefficient, "heating curve autotuned");
        }
        Ok(optimal)
    }

    pub fn status(&self, zone_id: &str, now: DateTime<FixedOffset>) -> Result<ZoneStatus> {
        let zone = self.registry.get(zone_id)?;
        Ok(self.build_status(zone, now))
    }

    pub fn statuses(&self, now: DateTime<FixedOffset>) -> Vec<ZoneStatus> {
        self.registry
            .zones()
            .map(|zone| self.build_status(zone, now))
            .collect()
    }

    fn build_status(&self, zone: &Zone, now: DateTime<FixedOffset>) -> ZoneStatus {
        let now_utc = now.with_timezone(&Utc);
        let outcome = self
            .last_report
            .as_ref()
            .and_then(|report| report.zone(&zone.id));

        ZoneStatus {
            id: zone.id.clone(),
            name: zone.name.clone(),
            enabled: zone.enabled,
            state: self.engine.state(&zone.id),
            hvac_mode: zone.hvac_mode,
            preset_mode: zone.preset_mode,
            current_temperature: zone.current_temperature,
            base_target_temperature: zone.base_target_temperature,
            effective_target_temperature: outcome
                .map(|outcome| outcome.target)
                .unwrap_or(zone.base_target_temperature),
            target_source: outcome
                .map(|outcome| outcome.source)
                .unwrap_or(TargetSource::Base),
            hysteresis: zone.hysteresis(&self.settings),
            manual_override: zone.manual_override,
            boost_active: zone.is_boost_active(now_utc),
            boost_remaining_min: zone.boost_remaining_minutes(now_utc),
            active_schedule: self
                .last_schedules
                .active
                .get(&zone.id)
                .map(|active| active.schedule_id.clone()),
            next_schedule_event_epoch: next_event_epoch(&zone.schedules, now),
            actuation_failures: outcome
                .map(|outcome| outcome.actuation_failures)
                .unwrap_or_default(),
        }
    }
}
