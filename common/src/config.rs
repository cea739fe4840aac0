use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    error::{HeatingError, Result},
    heating_curve::HeatingCurveState,
    types::{HeatingSystemType, PresetMode},
};

pub const MIN_HYSTERESIS: f32 = 0.1;
pub const MAX_HYSTERESIS: f32 = 2.0;
pub const MIN_TARGET_TEMP: f32 = 5.0;
pub const MAX_TARGET_TEMP: f32 = 35.0;
/// Absolute floor used when a window forces a zone off or a device cannot power down.
pub const FROST_FLOOR_TEMP: f32 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub cycle_interval_ms: u64,
    pub sensor_stale_timeout_ms: u64,
    pub state_publish_interval_ms: u64,
    pub min_valid_temp_c: f32,
    pub max_valid_temp_c: f32,
    pub thermostat_setpoint_deadband_c: f32,
    pub boost_default_minutes: u32,
    pub smart_boost_margin_minutes: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 60_000,
            sensor_stale_timeout_ms: 900_000,
            state_publish_interval_ms: 30_000,
            min_valid_temp_c: -40.0,
            max_valid_temp_c: 80.0,
            thermostat_setpoint_deadband_c: 0.1,
            boost_default_minutes: 60,
            smart_boost_margin_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetTemperatures {
    pub away: f32,
    pub eco: f32,
    pub comfort: f32,
    pub home: f32,
    pub sleep: f32,
    pub activity: f32,
    pub boost: f32,
}

impl Default for PresetTemperatures {
    fn default() -> Self {
        Self {
            away: 16.0,
            eco: 18.0,
            comfort: 22.0,
            home: 21.0,
            sleep: 18.0,
            activity: 21.0,
            boost: 25.0,
        }
    }
}

impl PresetTemperatures {
    pub fn get(&self, preset: PresetMode) -> Option<f32> {
        match preset {
            PresetMode::None => None,
            PresetMode::Away => Some(self.away),
            PresetMode::Eco => Some(self.eco),
            PresetMode::Comfort => Some(self.comfort),
            PresetMode::Home => Some(self.home),
            PresetMode::Sleep => Some(self.sleep),
            PresetMode::Activity => Some(self.activity),
            PresetMode::Boost => Some(self.boost),
        }
    }

    pub fn slot_mut(&mut self, preset: PresetMode) -> Option<&mut f32> {
        match preset {
            PresetMode::None => None,
            PresetMode::Away => Some(&mut self.away),
            PresetMode::Eco => Some(&mut self.eco),
            PresetMode::Comfort => Some(&mut self.comfort),
            PresetMode::Home => Some(&mut self.home),
            PresetMode::Sleep => Some(&mut self.sleep),
            PresetMode::Activity => Some(&mut self.activity),
            PresetMode::Boost => Some(&mut self.boost),
        }
    }

    pub fn sanitize(&mut self) {
        for preset in PresetMode::ALL {
            if let Some(slot) = self.slot_mut(preset) {
                *slot = clamp_target(*slot);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrostProtection {
    pub enabled: bool,
    pub min_temperature: f32,
}

impl Default for FrostProtection {
    fn default() -> Self {
        Self {
            enabled: false,
            min_temperature: 7.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VacationMode {
    pub enabled: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub preset_mode: Option<PresetMode>,
    pub min_temperature: Option<f32>,
    pub frost_protection_override: Option<f32>,
}

impl Default for VacationMode {
    fn default() -> Self {
        Self {
            enabled: false,
            start_date: None,
            end_date: None,
            preset_mode: Some(PresetMode::Away),
            min_temperature: None,
            frost_protection_override: None,
        }
    }
}

impl VacationMode {
    pub fn is_active(&self, today: NaiveDate) -> bool {
        self.enabled
            && self.start_date.map(|start| today >= start).unwrap_or(true)
            && self.end_date.map(|end| today <= end).unwrap_or(true)
    }
}

/// Setpoints driven into temperature-controlled valves (TRVs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrvSettings {
    pub offset: f32,
    pub min_heating_temp: f32,
    pub idle_temp: f32,
}

impl Default for TrvSettings {
    fn default() -> Self {
        Self {
            offset: 0.0,
            min_heating_temp: 25.0,
            idle_temp: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatingCurveSettings {
    pub enabled: bool,
    pub system: HeatingSystemType,
    pub outdoor_sensor: Option<String>,
}

impl Default for HeatingCurveSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            system: HeatingSystemType::Radiator,
            outdoor_sensor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoilerSettings {
    pub entity_id: Option<String>,
    pub overhead: f32,
    pub return_temperature_sensor: Option<String>,
    pub min_return_margin: f32,
    pub heating_curve: HeatingCurveSettings,
}

impl Default for BoilerSettings {
    fn default() -> Self {
        Self {
            entity_id: None,
            overhead: 20.0,
            return_temperature_sensor: None,
            min_return_margin: 5.0,
            heating_curve: HeatingCurveSettings::default(),
        }
    }
}

/// Settings shared by every zone. Zones hold only optional overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub hysteresis: f32,
    pub presets: PresetTemperatures,
    pub frost_protection: FrostProtection,
    pub vacation: VacationMode,
    pub global_presence_sensors: Vec<String>,
    pub trv: TrvSettings,
    pub boiler: BoilerSettings,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            hysteresis: 0.5,
            presets: PresetTemperatures::default(),
            frost_protection: FrostProtection::default(),
            vacation: VacationMode::default(),
            global_presence_sensors: Vec::new(),
            trv: TrvSettings::default(),
            boiler: BoilerSettings::default(),
        }
    }
}

impl GlobalSettings {
    pub fn sanitize(&mut self) {
        self.hysteresis = self.hysteresis.clamp(MIN_HYSTERESIS, MAX_HYSTERESIS);
        self.presets.sanitize();
        self.frost_protection.min_temperature =
            self.frost_protection.min_temperature.clamp(3.0, 15.0);
        self.boiler.overhead = self.boiler.overhead.clamp(0.0, 50.0);
        self.boiler.min_return_margin = self.boiler.min_return_margin.clamp(0.0, 30.0);
        self.trv.idle_temp = clamp_target(self.trv.idle_temp);
        self.trv.min_heating_temp = clamp_target(self.trv.min_heating_temp);
        if self.vacation.preset_mode == Some(PresetMode::Boost) {
            self.vacation.preset_mode = Some(PresetMode::Away);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub topic_prefix: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            topic_prefix: "heating".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub settings: GlobalSettings,
    pub timezone: String,
    pub network: NetworkConfig,
    pub curve: HeatingCurveState,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            settings: GlobalSettings::default(),
            timezone: "Europe/Amsterdam".to_string(),
            network: NetworkConfig::default(),
            curve: HeatingCurveState::default(),
        }
    }
}

pub fn clamp_target(temp: f32) -> f32 {
    temp.clamp(MIN_TARGET_TEMP, MAX_TARGET_TEMP)
}

pub fn validate_target(temp: f32) -> Result<f32> {
    if temp.is_finite() && (MIN_TARGET_TEMP..=MAX_TARGET_TEMP).contains(&temp) {
        Ok(temp)
    } else {
        Err(HeatingError::validation(format!(
            "temperature {temp} outside {MIN_TARGET_TEMP}-{MAX_TARGET_TEMP}"
        )))
    }
}

pub fn validate_hysteresis(value: f32) -> Result<f32> {
    if value.is_finite() && (MIN_HYSTERESIS..=MAX_HYSTERESIS).contains(&value) {
        Ok(value)
    } else {
        Err(HeatingError::validation(format!(
            "hysteresis {value} outside {MIN_HYSTERESIS}-{MAX_HYSTERESIS}"
        )))
    }
}
