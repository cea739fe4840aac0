//! One consistent view of every input a control cycle reads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{
    config::{ControllerConfig, GlobalSettings},
    ports::StateStore,
    temperature::{average, TemperatureReader},
    types::{DeviceKind, WindowAction},
    zone::Zone,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowReading {
    TurnOff,
    Reduce { temp_drop: f32 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneReadings {
    pub temperatures: Vec<f32>,
    pub current: Option<f32>,
    pub window: Option<WindowReading>,
    /// `None` when the zone has no presence sensors.
    pub presence: Option<bool>,
    /// Some thermostat in the zone reports it is actively heating.
    pub thermostat_heating: bool,
    pub outdoor: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct SensorSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub zones: HashMap<String, ZoneReadings>,
    pub outdoor: Option<f32>,
    pub boiler_return: Option<f32>,
}

impl SensorSnapshot {
    pub fn capture<'z>(
        zones: impl IntoIterator<Item = &'z Zone>,
        settings: &GlobalSettings,
        config: &ControllerConfig,
        store: &dyn StateStore,
        now: DateTime<Utc>,
    ) -> Self {
        let reader = TemperatureReader::new(store, config, now);
        let outdoor = settings
            .boiler
            .heating_curve
            .outdoor_sensor
            .as_deref()
            .and_then(|entity| reader.read_sensor(entity).ok());
        let boiler_return = settings
            .boiler
            .return_temperature_sensor
            .as_deref()
            .and_then(|entity| reader.read_sensor(entity).ok());

        let zones = zones
            .into_iter()
            .map(|zone| {
                let readings = Self::read_zone(zone, settings, &reader, store, outdoor);
                (zone.id.clone(), readings)
            })
            .collect();

        Self {
            taken_at: Some(now),
            zones,
            outdoor,
            boiler_return,
        }
    }

    pub fn zone(&self, zone_id: &str) -> ZoneReadings {
        self.zones.get(zone_id).cloned().unwrap_or_default()
    }

    fn read_zone(
        zone: &Zone,
        settings: &GlobalSettings,
        reader: &TemperatureReader<'_>,
        store: &dyn StateStore,
        outdoor: Option<f32>,
    ) -> ZoneReadings {
        let temperatures = reader.collect_zone_temperatures(zone);
        let current = average(&temperatures);

        let mut window = None;
        for sensor in &zone.window_sensors {
            let open = store
                .get_state(&sensor.sensor_id)
                .map(|state| state.is_on())
                .unwrap_or(false);
            if !open {
                continue;
            }
            window = match (sensor.action, window) {
                (WindowAction::None, existing) => existing,
                (WindowAction::TurnOff, _) | (_, Some(WindowReading::TurnOff)) => {
                    Some(WindowReading::TurnOff)
                }
                (WindowAction::ReduceTemperature, Some(WindowReading::Reduce { temp_drop })) => {
                    Some(WindowReading::Reduce {
                        temp_drop: temp_drop.max(sensor.temp_drop),
                    })
                }
                (WindowAction::ReduceTemperature, None) => Some(WindowReading::Reduce {
                    temp_drop: sensor.temp_drop,
                }),
            };
        }

        let presence_entities = zone.presence_entities(settings);
        let presence = if presence_entities.is_empty() {
            None
        } else {
            Some(presence_entities.iter().any(|entity| {
                store
                    .get_state(entity)
                    .map(|state| state.is_on())
                    .unwrap_or(false)
            }))
        };

        let thermostat_heating = zone
            .entities_of(DeviceKind::Thermostat)
            .iter()
            .filter_map(|entity| store.get_state(entity))
            .any(|state| {
                matches!(
                    state.attribute_str("hvac_action"),
                    Some("heating") | Some("preheating")
                )
            });

        let zone_outdoor = zone
            .smart_night_boost
            .weather_source_id
            .as_deref()
            .and_then(|entity| reader.read_sensor(entity).ok())
            .or(outdoor);

        ZoneReadings {
            temperatures,
            current,
            window,
            presence,
            thermostat_heating,
            outdoor: zone_outdoor,
        }
    }
}
