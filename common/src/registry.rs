//! Zone CRUD. Every operation validates its input before touching the zone,
//! so a rejected call leaves the registry unchanged.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::{
    config::{validate_hysteresis, validate_target},
    error::{HeatingError, Result},
    schedule::Schedule,
    types::{HvacMode, PresetMode},
    zone::{DeviceEntry, NightBoost, PresenceSensor, SmartNightBoost, WindowSensor, Zone},
};

const MAX_BOOST_MINUTES: u32 = 24 * 60;
const MAX_NIGHT_BOOST_OFFSET: f32 = 5.0;
const MAX_WINDOW_DROP: f32 = 15.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneRegistry {
    zones: BTreeMap<String, Zone>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load persisted zones. Invalid schedules are dropped rather than failing the load.
    pub fn from_zones(zones: Vec<Zone>) -> Result<Self> {
        let mut registry = Self::new();
        for mut zone in zones {
            if zone.id.trim().is_empty() {
                return Err(HeatingError::validation("zone id cannot be empty"));
            }
            if registry.zones.contains_key(&zone.id) {
                return Err(HeatingError::validation(format!(
                    "duplicate zone id {}",
                    zone.id
                )));
            }
            zone.schedules.retain(|schedule| match schedule.validate() {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(zone = %zone.id, schedule = %schedule.id, "dropping schedule: {err}");
                    false
                }
            });
            zone.base_target_temperature = crate::config::clamp_target(zone.base_target_temperature);
            if let Some(hysteresis) = zone.hysteresis_override {
                if validate_hysteresis(hysteresis).is_err() {
                    zone.hysteresis_override = None;
                }
            }
            registry.zones.insert(zone.id.clone(), zone);
        }
        Ok(registry)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn zones_mut(&mut self) -> impl Iterator<Item = &mut Zone> {
        self.zones.values_mut()
    }

    pub fn to_vec(&self) -> Vec<Zone> {
        self.zones.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn contains(&self, zone_id: &str) -> bool {
        self.zones.contains_key(zone_id)
    }

    pub fn get(&self, zone_id: &str) -> Result<&Zone> {
        self.zones
            .get(zone_id)
            .ok_or_else(|| HeatingError::UnknownZone(zone_id.to_string()))
    }

    fn get_mut(&mut self, zone_id: &str) -> Result<&mut Zone> {
        self.zones
            .get_mut(zone_id)
            .ok_or_else(|| HeatingError::UnknownZone(zone_id.to_string()))
    }

    pub fn create_zone(&mut self, zone_id: &str, name: &str) -> Result<&Zone> {
        let zone_id = zone_id.trim();
        if zone_id.is_empty() {
            return Err(HeatingError::validation("zone id cannot be empty"));
        }
        if self.zones.contains_key(zone_id) {
            return Err(HeatingError::validation(format!(
                "zone {zone_id} already exists"
            )));
        }
        let name = if name.trim().is_empty() { zone_id } else { name };
        tracing::info!(zone = zone_id, "zone created");
        Ok(self
            .zones
            .entry(zone_id.to_string())
            .or_insert_with(|| Zone::new(zone_id, name)))
    }

    /// Create the zone if it does not exist yet. Returns true when created.
    pub fn ensure_zone(&mut self, zone_id: &str, name: &str) -> Result<bool> {
        if self.zones.contains_key(zone_id.trim()) {
            return Ok(false);
        }
        self.create_zone(zone_id, name)?;
        Ok(true)
    }

    pub fn delete_zone(&mut self, zone_id: &str) -> Result<Zone> {
        let zone = self
            .zones
            .remove(zone_id)
            .ok_or_else(|| HeatingError::UnknownZone(zone_id.to_string()))?;
        tracing::info!(zone = zone_id, "zone deleted");
        Ok(zone)
    }

    pub fn rename_zone(&mut self, zone_id: &str, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(HeatingError::validation("zone name cannot be empty"));
        }
        self.get_mut(zone_id)?.name = name.trim().to_string();
        Ok(())
    }

    pub fn set_hidden(&mut self, zone_id: &str, hidden: bool) -> Result<()> {
        self.get_mut(zone_id)?.hidden = hidden;
        Ok(())
    }

    /// A user-chosen target drops any non-boost preset so the value takes effect.
    pub fn set_target_temperature(&mut self, zone_id: &str, temperature: f32) -> Result<()> {
        let temperature = validate_target(temperature)?;
        let zone = self.get_mut(zone_id)?;
        zone.base_target_temperature = temperature;
        if zone.preset_mode != PresetMode::Boost {
            zone.preset_mode = PresetMode::None;
        }
        Ok(())
    }

    pub fn set_hvac_mode(&mut self, zone_id: &str, mode: HvacMode) -> Result<()> {
        self.get_mut(zone_id)?.hvac_mode = mode;
        Ok(())
    }

    pub fn set_enabled(&mut self, zone_id: &str, enabled: bool) -> Result<()> {
        self.get_mut(zone_id)?.enabled = enabled;
        Ok(())
    }

    /// Boost has its own operation; choosing any other preset cancels a running boost.
    pub fn set_preset_mode(&mut self, zone_id: &str, preset: PresetMode) -> Result<()> {
        if preset == PresetMode::Boost {
            return Err(HeatingError::validation(
                "boost is started with a duration, not as a preset",
            ));
        }
        let zone = self.get_mut(zone_id)?;
        zone.cancel_boost();
        zone.preset_mode = preset;
        Ok(())
    }

    pub fn set_preset_temperature(
        &mut self,
        zone_id: &str,
        preset: PresetMode,
        temperature: f32,
    ) -> Result<()> {
        let temperature = validate_target(temperature)?;
        self.get_mut(zone_id)?
            .presets
            .set_local(preset, temperature)
    }

    pub fn set_boost(
        &mut self,
        zone_id: &str,
        temperature: f32,
        duration_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let temperature = validate_target(temperature)?;
        if duration_minutes == 0 || duration_minutes > MAX_BOOST_MINUTES {
            return Err(HeatingError::validation(format!(
                "boost duration {duration_minutes} out of range (1..={MAX_BOOST_MINUTES} min)"
            )));
        }
        self.get_mut(zone_id)?
            .set_boost(temperature, duration_minutes, now);
        tracing::info!(zone = zone_id, temperature, duration_minutes, "boost started");
        Ok(())
    }

    pub fn cancel_boost(&mut self, zone_id: &str) -> Result<bool> {
        Ok(self.get_mut(zone_id)?.cancel_boost())
    }

    pub fn set_hysteresis_override(&mut self, zone_id: &str, hysteresis: Option<f32>) -> Result<()> {
        let hysteresis = hysteresis.map(validate_hysteresis).transpose()?;
        self.get_mut(zone_id)?.hysteresis_override = hysteresis;
        Ok(())
    }

    pub fn set_manual_override(&mut self, zone_id: &str, manual: bool) -> Result<()> {
        self.get_mut(zone_id)?.manual_override = manual;
        Ok(())
    }

    pub fn set_primary_sensor(&mut self, zone_id: &str, entity: Option<String>) -> Result<()> {
        self.get_mut(zone_id)?.primary_temperature_sensor =
            entity.filter(|entity| !entity.trim().is_empty());
        Ok(())
    }

    pub fn set_shutdown_switches_when_idle(&mut self, zone_id: &str, shutdown: bool) -> Result<()> {
        self.get_mut(zone_id)?.shutdown_switches_when_idle = shutdown;
        Ok(())
    }

    /// Assign a device, moving it out of any other zone. Returns the zone it left.
    pub fn assign_device(
        &mut self,
        zone_id: &str,
        device_id: &str,
        entry: DeviceEntry,
    ) -> Result<Option<String>> {
        if device_id.trim().is_empty() {
            return Err(HeatingError::validation("device id cannot be empty"));
        }
        self.get(zone_id)?;

        let previous = self
            .zones
            .values()
            .find(|zone| zone.id != zone_id && zone.devices.contains_key(device_id))
            .map(|zone| zone.id.clone());
        if let Some(previous) = &previous {
            if let Some(zone) = self.zones.get_mut(previous) {
                zone.devices.remove(device_id);
            }
            tracing::info!(device = device_id, from = %previous, to = zone_id, "device moved");
        }

        self.get_mut(zone_id)?
            .devices
            .insert(device_id.to_string(), entry);
        Ok(previous)
    }

    pub fn remove_device(&mut self, zone_id: &str, device_id: &str) -> Result<DeviceEntry> {
        let zone = self.get_mut(zone_id)?;
        let entry = zone
            .devices
            .remove(device_id)
            .ok_or_else(|| HeatingError::UnknownDevice {
                zone: zone_id.to_string(),
                device: device_id.to_string(),
            })?;
        if zone.primary_temperature_sensor.as_deref() == Some(entry.entity(device_id)) {
            zone.primary_temperature_sensor = None;
        }
        Ok(entry)
    }

    /// Insert or replace by schedule id.
    pub fn add_schedule(&mut self, zone_id: &str, schedule: Schedule) -> Result<()> {
        schedule.validate()?;
        let zone = self.get_mut(zone_id)?;
        match zone
            .schedules
            .iter_mut()
            .find(|existing| existing.id == schedule.id)
        {
            Some(existing) => *existing = schedule,
            None => zone.schedules.push(schedule),
        }
        Ok(())
    }

    pub fn remove_schedule(&mut self, zone_id: &str, schedule_id: &str) -> Result<Schedule> {
        let zone = self.get_mut(zone_id)?;
        let index = zone
            .schedules
            .iter()
            .position(|schedule| schedule.id == schedule_id)
            .ok_or_else(|| HeatingError::UnknownSchedule {
                zone: zone_id.to_string(),
                schedule: schedule_id.to_string(),
            })?;
        Ok(zone.schedules.remove(index))
    }

    pub fn replace_schedules(&mut self, zone_id: &str, schedules: Vec<Schedule>) -> Result<()> {
        let mut seen = HashSet::new();
        for schedule in &schedules {
            schedule.validate()?;
            if !seen.insert(schedule.id.as_str()) {
                return Err(HeatingError::validation(format!(
                    "duplicate schedule id {}",
                    schedule.id
                )));
            }
        }
        self.get_mut(zone_id)?.schedules = schedules;
        Ok(())
    }

    pub fn set_schedule_enabled(
        &mut self,
        zone_id: &str,
        schedule_id: &str,
        enabled: bool,
    ) -> Result<()> {
        let zone = self.get_mut(zone_id)?;
        let schedule = zone
            .schedules
            .iter_mut()
            .find(|schedule| schedule.id == schedule_id)
            .ok_or_else(|| HeatingError::UnknownSchedule {
                zone: zone_id.to_string(),
                schedule: schedule_id.to_string(),
            })?;
        schedule.enabled = enabled;
        Ok(())
    }

    pub fn set_night_boost(&mut self, zone_id: &str, night_boost: NightBoost) -> Result<()> {
        if !(0.0..=MAX_NIGHT_BOOST_OFFSET).contains(&night_boost.offset) {
            return Err(HeatingError::validation(format!(
                "night boost offset {} out of range (0-{MAX_NIGHT_BOOST_OFFSET})",
                night_boost.offset
            )));
        }
        if night_boost.start_time == night_boost.end_time {
            return Err(HeatingError::validation("night boost window is empty"));
        }
        self.get_mut(zone_id)?.night_boost = night_boost;
        Ok(())
    }

    pub fn set_smart_night_boost(&mut self, zone_id: &str, smart: SmartNightBoost) -> Result<()> {
        self.get_mut(zone_id)?.smart_night_boost = smart;
        Ok(())
    }

    /// Insert or replace by sensor id.
    pub fn add_window_sensor(&mut self, zone_id: &str, sensor: WindowSensor) -> Result<()> {
        if sensor.sensor_id.trim().is_empty() {
            return Err(HeatingError::validation("sensor id cannot be empty"));
        }
        if !(0.0..=MAX_WINDOW_DROP).contains(&sensor.temp_drop) {
            return Err(HeatingError::validation(format!(
                "window temperature drop {} out of range (0-{MAX_WINDOW_DROP})",
                sensor.temp_drop
            )));
        }
        let zone = self.get_mut(zone_id)?;
        zone.window_sensors
            .retain(|existing| existing.sensor_id != sensor.sensor_id);
        zone.window_sensors.push(sensor);
        Ok(())
    }

    pub fn remove_window_sensor(&mut self, zone_id: &str, sensor_id: &str) -> Result<()> {
        let zone = self.get_mut(zone_id)?;
        let before = zone.window_sensors.len();
        zone.window_sensors
            .retain(|sensor| sensor.sensor_id != sensor_id);
        if zone.window_sensors.len() == before {
            return Err(HeatingError::UnknownDevice {
                zone: zone_id.to_string(),
                device: sensor_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn add_presence_sensor(&mut self, zone_id: &str, sensor: PresenceSensor) -> Result<()> {
        if sensor.sensor_id.trim().is_empty() {
            return Err(HeatingError::validation("sensor id cannot be empty"));
        }
        let zone = self.get_mut(zone_id)?;
        if !zone
            .presence_sensors
            .iter()
            .any(|existing| existing.sensor_id == sensor.sensor_id)
        {
            zone.presence_sensors.push(sensor);
        }
        Ok(())
    }

    pub fn remove_presence_sensor(&mut self, zone_id: &str, sensor_id: &str) -> Result<()> {
        let zone = self.get_mut(zone_id)?;
        let before = zone.presence_sensors.len();
        zone.presence_sensors
            .retain(|sensor| sensor.sensor_id != sensor_id);
        if zone.presence_sensors.len() == before {
            return Err(HeatingError::UnknownDevice {
                zone: zone_id.to_string(),
                device: sensor_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_presence_options(
        &mut self,
        zone_id: &str,
        use_global_presence: bool,
        auto_preset: Option<(PresetMode, PresetMode)>,
    ) -> Result<()> {
        if let Some((home, away)) = auto_preset {
            if [home, away]
                .iter()
                .any(|preset| matches!(preset, PresetMode::None | PresetMode::Boost))
            {
                return Err(HeatingError::validation(
                    "auto presets must name a temperature preset",
                ));
            }
        }
        let zone = self.get_mut(zone_id)?;
        zone.use_global_presence = use_global_presence;
        zone.auto_preset_enabled = auto_preset.is_some();
        if let Some((home, away)) = auto_preset {
            zone.auto_preset_home = home;
            zone.auto_preset_away = away;
        }
        Ok(())
    }
}
