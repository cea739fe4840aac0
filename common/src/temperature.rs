use chrono::{DateTime, Utc};

use crate::{
    config::ControllerConfig,
    error::{HeatingError, Result},
    ports::{EntityState, StateStore},
    types::DeviceKind,
    zone::Zone,
};

/// Reads temperatures from the state store in °C, filtering stale and invalid values.
pub struct TemperatureReader<'a> {
    store: &'a dyn StateStore,
    config: &'a ControllerConfig,
    now: DateTime<Utc>,
}

impl<'a> TemperatureReader<'a> {
    pub fn new(store: &'a dyn StateStore, config: &'a ControllerConfig, now: DateTime<Utc>) -> Self {
        Self { store, config, now }
    }

    pub fn read_sensor(&self, entity_id: &str) -> Result<f32> {
        let state = self.fresh_state(entity_id)?;
        let raw = state
            .numeric_value()
            .or_else(|| state.attribute_f32("temperature"))
            .ok_or_else(|| unavailable(entity_id, "non-numeric state"))?;
        self.normalize(entity_id, raw, unit_of(&state))
    }

    pub fn read_thermostat_current(&self, entity_id: &str) -> Result<f32> {
        let state = self.fresh_state(entity_id)?;
        let raw = state
            .attribute_f32("current_temperature")
            .ok_or_else(|| unavailable(entity_id, "no current_temperature"))?;
        self.normalize(entity_id, raw, unit_of(&state))
    }

    /// Every readable temperature in the zone, or only the primary sensor when one
    /// is configured and readable. Never fails; unreadable sources are skipped.
    pub fn collect_zone_temperatures(&self, zone: &Zone) -> Vec<f32> {
        if let Some(primary) = zone.primary_temperature_sensor.as_deref() {
            match self.read_sensor(primary) {
                Ok(value) => return vec![value],
                Err(err) => tracing::debug!(zone = %zone.id, "primary sensor skipped: {err}"),
            }
        }

        let sensors = zone
            .entities_of(DeviceKind::TemperatureSensor)
            .into_iter()
            .map(|entity| self.read_sensor(&entity));
        let thermostats = zone
            .entities_of(DeviceKind::Thermostat)
            .into_iter()
            .map(|entity| self.read_thermostat_current(&entity));

        sensors
            .chain(thermostats)
            .filter_map(|reading| match reading {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::debug!(zone = %zone.id, "reading skipped: {err}");
                    None
                }
            })
            .collect()
    }

    fn fresh_state(&self, entity_id: &str) -> Result<EntityState> {
        let state = self
            .store
            .get_state(entity_id)
            .ok_or_else(|| unavailable(entity_id, "no state"))?;
        if state.is_unavailable() {
            return Err(unavailable(entity_id, &state.value));
        }
        if let Some(updated) = state.last_updated {
            let age_ms = (self.now - updated).num_milliseconds();
            if age_ms > self.config.sensor_stale_timeout_ms as i64 {
                return Err(unavailable(entity_id, "stale"));
            }
        }
        Ok(state)
    }

    fn normalize(&self, entity_id: &str, raw: f32, unit: Option<&str>) -> Result<f32> {
        let celsius = if unit.map(is_fahrenheit).unwrap_or(false) {
            (raw - 32.0) * 5.0 / 9.0
        } else {
            raw
        };
        if !(self.config.min_valid_temp_c..=self.config.max_valid_temp_c).contains(&celsius) {
            return Err(unavailable(entity_id, "out of range"));
        }
        Ok(celsius)
    }
}

pub fn average(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f32>() / values.len() as f32)
}

fn unit_of(state: &EntityState) -> Option<&str> {
    state
        .unit
        .as_deref()
        .or_else(|| state.attribute_str("unit_of_measurement"))
        .or_else(|| state.attribute_str("temperature_unit"))
}

fn is_fahrenheit(unit: &str) -> bool {
    let unit = unit.trim().trim_start_matches('°');
    unit.eq_ignore_ascii_case("f") || unit.eq_ignore_ascii_case("fahrenheit")
}

fn unavailable(entity_id: &str, reason: &str) -> HeatingError {
    HeatingError::SensorUnavailable(format!("{entity_id}: {reason}"))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{testing::MemoryStateStore, zone::DeviceEntry};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_600_000, 0).unwrap()
    }

    fn zone_with_devices() -> Zone {
        let mut zone = Zone::new("office", "Office");
        zone.devices.insert(
            "sensor/office".to_string(),
            DeviceEntry::new(DeviceKind::TemperatureSensor),
        );
        zone.devices.insert(
            "trv".to_string(),
            DeviceEntry {
                kind: DeviceKind::Thermostat,
                source_topic: "z2m/office-trv".to_string(),
            },
        );
        zone
    }

    #[test]
    fn converts_fahrenheit() {
        let store = MemoryStateStore::new();
        store.set("sensor/f", EntityState::new("68").with_unit("°F"));
        let config = ControllerConfig::default();
        let reader = TemperatureReader::new(&store, &config, now());

        assert!((reader.read_sensor("sensor/f").unwrap() - 20.0).abs() < 1e-4);
    }

    #[test]
    fn soft_fails_on_bad_states() {
        let store = MemoryStateStore::new();
        store.set_value("sensor/a", "unavailable");
        store.set_value("sensor/b", "warm");
        store.set_value("sensor/c", "400");
        store.set(
            "sensor/d",
            EntityState::new("20").updated_at(now() - Duration::hours(2)),
        );
        let config = ControllerConfig::default();
        let reader = TemperatureReader::new(&store, &config, now());

        for entity in ["sensor/a", "sensor/b", "sensor/c", "sensor/d", "sensor/missing"] {
            assert!(matches!(
                reader.read_sensor(entity),
                Err(HeatingError::SensorUnavailable(_))
            ));
        }
    }

    #[test]
    fn collects_sensors_and_thermostat_currents() {
        let store = MemoryStateStore::new();
        store.set_value("sensor/office", "19.0");
        store.set(
            "z2m/office-trv",
            EntityState::new("heat").with_attribute("current_temperature", 21.0),
        );
        let config = ControllerConfig::default();
        let reader = TemperatureReader::new(&store, &config, now());

        let readings = reader.collect_zone_temperatures(&zone_with_devices());
        assert_eq!(readings, vec![19.0, 21.0]);
        assert_eq!(average(&readings), Some(20.0));
    }

    #[test]
    fn primary_sensor_is_authoritative_when_readable() {
        let store = MemoryStateStore::new();
        store.set_value("sensor/office", "19.0");
        store.set_value("sensor/desk", "22.5");
        let config = ControllerConfig::default();
        let reader = TemperatureReader::new(&store, &config, now());

        let mut zone = zone_with_devices();
        zone.primary_temperature_sensor = Some("sensor/desk".to_string());
        assert_eq!(reader.collect_zone_temperatures(&zone), vec![22.5]);

        store.set_value("sensor/desk", "unknown");
        assert_eq!(reader.collect_zone_temperatures(&zone), vec![19.0]);
    }

    #[test]
    fn nothing_readable_yields_empty() {
        let store = MemoryStateStore::new();
        let config = ControllerConfig::default();
        let reader = TemperatureReader::new(&store, &config, now());
        assert!(reader.collect_zone_temperatures(&zone_with_devices()).is_empty());
        assert_eq!(average(&[]), None);
    }
}
