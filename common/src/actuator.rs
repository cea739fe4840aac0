//! Capability-aware device control.
//!
//! Capabilities are discovered from an entity's state attributes the first
//! time it is seen and memoized. Thermostat setpoints are cached per entity so
//! repeated cycles do not re-send identical commands.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::{
    config::TrvSettings,
    error::Result,
    ports::{DeviceCommand, EntityState, StateStore},
    types::HvacMode,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCapability {
    /// Native numeric range; min closes, max opens.
    Position { min: f32, max: f32 },
    /// Accepts a temperature setpoint.
    Temperature,
    /// Plain on/off.
    None,
}

impl DeviceCapability {
    pub fn detect(state: &EntityState) -> Self {
        if let (Some(min), Some(max)) = (state.attribute_f32("min"), state.attribute_f32("max")) {
            if min < max {
                return Self::Position { min, max };
            }
        }
        let temperature_keys = ["temperature", "current_temperature", "min_temp", "hvac_modes"];
        if temperature_keys
            .iter()
            .any(|key| state.attributes.contains_key(*key))
        {
            return Self::Temperature;
        }
        Self::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    Heat,
    Idle,
}

#[derive(Debug, Clone)]
pub struct DeviceActuator {
    capabilities: HashMap<String, DeviceCapability>,
    last_setpoints: HashMap<String, f32>,
    powered_off: HashSet<String>,
    deadband: f32,
}

impl DeviceActuator {
    pub fn new(deadband: f32) -> Self {
        Self {
            capabilities: HashMap::new(),
            last_setpoints: HashMap::new(),
            powered_off: HashSet::new(),
            deadband,
        }
    }

    pub fn set_deadband(&mut self, deadband: f32) {
        self.deadband = deadband;
    }

    /// Resolve and memoize. Entities without state yet are not cached.
    pub fn capability(&mut self, store: &dyn StateStore, entity: &str) -> DeviceCapability {
        if let Some(capability) = self.capabilities.get(entity) {
            return *capability;
        }
        let Some(state) = store.get_state(entity) else {
            return DeviceCapability::None;
        };
        let capability = DeviceCapability::detect(&state);
        tracing::debug!(entity, ?capability, "device capability resolved");
        self.capabilities.insert(entity.to_string(), capability);
        capability
    }

    pub fn cached_capability(&self, entity: &str) -> Option<DeviceCapability> {
        self.capabilities.get(entity).copied()
    }

    pub fn last_setpoint(&self, entity: &str) -> Option<f32> {
        self.last_setpoints.get(entity).copied()
    }

    /// Drop everything known about an entity, e.g. after it is reassigned.
    pub fn forget(&mut self, entity: &str) {
        self.capabilities.remove(entity);
        self.last_setpoints.remove(entity);
        self.powered_off.remove(entity);
    }

    /// Returns true when a command was actually sent.
    pub fn set_thermostat_temperature(
        &mut self,
        store: &dyn StateStore,
        entity: &str,
        temperature: f32,
    ) -> Result<bool> {
        let mut sent = false;
        if self.powered_off.contains(entity) {
            store.command(
                entity,
                &DeviceCommand::SetHvacMode {
                    hvac_mode: HvacMode::Heat,
                },
            )?;
            self.powered_off.remove(entity);
            sent = true;
        }
        Ok(self.send_setpoint(store, entity, temperature)? || sent)
    }

    /// Power a thermostat down, falling back to `frost_floor` when it has no off mode.
    pub fn turn_off_thermostat(
        &mut self,
        store: &dyn StateStore,
        entity: &str,
        frost_floor: f32,
    ) -> Result<bool> {
        if self.powered_off.contains(entity) {
            return Ok(false);
        }

        if supports_off(store.get_state(entity).as_ref()) {
            let off = DeviceCommand::SetHvacMode {
                hvac_mode: HvacMode::Off,
            };
            match store.command(entity, &off) {
                Ok(()) => {
                    self.powered_off.insert(entity.to_string());
                    self.last_setpoints.remove(entity);
                    return Ok(true);
                }
                Err(err) => {
                    tracing::warn!(entity, "power-off failed, falling back to floor: {err}");
                }
            }
        }

        self.send_setpoint(store, entity, frost_floor)
    }

    /// Switches and pumps; skipped when the reported state already matches.
    pub fn set_switch(&mut self, store: &dyn StateStore, entity: &str, on: bool) -> Result<bool> {
        if let Some(state) = store.get_state(entity) {
            if !state.is_unavailable() && state.is_on() == on {
                return Ok(false);
            }
        }
        let command = if on {
            DeviceCommand::TurnOn
        } else {
            DeviceCommand::TurnOff
        };
        store.command(entity, &command)?;
        Ok(true)
    }

    pub fn drive_valve(
        &mut self,
        store: &dyn StateStore,
        entity: &str,
        demand: Demand,
        target: f32,
        trv: &TrvSettings,
    ) -> Result<bool> {
        match self.capability(store, entity) {
            DeviceCapability::Position { min, max } => {
                let position = match demand {
                    Demand::Heat => max,
                    Demand::Idle => min,
                };
                let current = store
                    .get_state(entity)
                    .and_then(|state| state.numeric_value());
                if current.map(|value| (value - position).abs() < f32::EPSILON) == Some(true) {
                    return Ok(false);
                }
                store.command(entity, &DeviceCommand::SetPosition { position })?;
                Ok(true)
            }
            DeviceCapability::Temperature => {
                let setpoint = match demand {
                    Demand::Heat => (target + trv.offset).max(trv.min_heating_temp),
                    Demand::Idle => trv.idle_temp,
                };
                self.send_setpoint(store, entity, setpoint)
            }
            DeviceCapability::None => self.set_switch(store, entity, demand == Demand::Heat),
        }
    }

    /// Shared boiler or gateway: a flow setpoint, or off.
    pub fn set_boiler(
        &mut self,
        store: &dyn StateStore,
        entity: &str,
        setpoint: Option<f32>,
    ) -> Result<bool> {
        match setpoint {
            Some(setpoint) => self.set_thermostat_temperature(store, entity, setpoint),
            None => {
                if self.powered_off.contains(entity) {
                    return Ok(false);
                }
                let command = if supports_off(store.get_state(entity).as_ref()) {
                    DeviceCommand::SetHvacMode {
                        hvac_mode: HvacMode::Off,
                    }
                } else {
                    DeviceCommand::TurnOff
                };
                store.command(entity, &command)?;
                self.powered_off.insert(entity.to_string());
                self.last_setpoints.remove(entity);
                Ok(true)
            }
        }
    }

    fn send_setpoint(&mut self, store: &dyn StateStore, entity: &str, setpoint: f32) -> Result<bool> {
        if let Some(last) = self.last_setpoints.get(entity) {
            if (last - setpoint).abs() < self.deadband {
                return Ok(false);
            }
        }
        store.command(
            entity,
            &DeviceCommand::SetTemperature {
                temperature: setpoint,
            },
        )?;
        self.last_setpoints.insert(entity.to_string(), setpoint);
        Ok(true)
    }
}

fn supports_off(state: Option<&EntityState>) -> bool {
    state
        .and_then(|state| state.attributes.get("hvac_modes"))
        .and_then(Value::as_array)
        .map(|modes| modes.iter().any(|mode| mode.as_str() == Some("off")))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::MemoryStateStore;

    #[test]
    fn detects_capabilities() {
        let position = EntityState::new("0").with_attribute("min", 0).with_attribute("max", 100);
        let trv = EntityState::new("heat").with_attribute("temperature", 20.0);
        let plug = EntityState::new("off");

        assert_eq!(
            DeviceCapability::detect(&position),
            DeviceCapability::Position {
                min: 0.0,
                max: 100.0
            }
        );
        assert_eq!(DeviceCapability::detect(&trv), DeviceCapability::Temperature);
        assert_eq!(DeviceCapability::detect(&plug), DeviceCapability::None);
    }

    #[test]
    fn capability_is_memoized() {
        let store = MemoryStateStore::new();
        store.set(
            "valve",
            EntityState::new("0").with_attribute("min", 0).with_attribute("max", 255),
        );
        let mut actuator = DeviceActuator::new(0.1);
        let first = actuator.capability(&store, "valve");

        // The state changing shape later does not trigger a re-query.
        store.set("valve", EntityState::new("on"));
        assert_eq!(actuator.capability(&store, "valve"), first);

        actuator.forget("valve");
        assert_eq!(actuator.capability(&store, "valve"), DeviceCapability::None);
    }

    #[test]
    fn suppresses_setpoints_within_deadband() {
        let store = MemoryStateStore::new();
        let mut actuator = DeviceActuator::new(0.1);

        assert!(actuator.set_thermostat_temperature(&store, "trv", 21.0).unwrap());
        assert!(!actuator.set_thermostat_temperature(&store, "trv", 21.05).unwrap());
        assert!(actuator.set_thermostat_temperature(&store, "trv", 21.5).unwrap());
        assert_eq!(store.commands_for("trv").len(), 2);
    }

    #[test]
    fn failed_setpoint_is_not_cached() {
        let store = MemoryStateStore::new();
        store.fail("trv");
        let mut actuator = DeviceActuator::new(0.1);

        assert!(actuator.set_thermostat_temperature(&store, "trv", 21.0).is_err());
        assert_eq!(actuator.last_setpoint("trv"), None);
    }

    #[test]
    fn power_off_falls_back_to_floor() {
        let store = MemoryStateStore::new();
        store.set(
            "climate/a",
            EntityState::new("heat").with_attribute("hvac_modes", json!(["heat", "off"])),
        );
        store.set(
            "climate/b",
            EntityState::new("heat").with_attribute("hvac_modes", json!(["heat"])),
        );
        let mut actuator = DeviceActuator::new(0.1);

        actuator.turn_off_thermostat(&store, "climate/a", 7.0).unwrap();
        actuator.turn_off_thermostat(&store, "climate/b", 7.0).unwrap();

        assert_eq!(
            store.commands_for("climate/a"),
            vec![DeviceCommand::SetHvacMode {
                hvac_mode: HvacMode::Off
            }]
        );
        assert_eq!(
            store.commands_for("climate/b"),
            vec![DeviceCommand::SetTemperature { temperature: 7.0 }]
        );

        // Coming back from off re-enables heat before the setpoint.
        actuator
            .set_thermostat_temperature(&store, "climate/a", 21.0)
            .unwrap();
        let commands = store.commands_for("climate/a");
        assert_eq!(
            commands[1..],
            [
                DeviceCommand::SetHvacMode {
                    hvac_mode: HvacMode::Heat
                },
                DeviceCommand::SetTemperature { temperature: 21.0 },
            ]
        );
    }

    #[test]
    fn valves_follow_capability() {
        let store = MemoryStateStore::new();
        store.set(
            "valve/pos",
            EntityState::new("0").with_attribute("min", 0).with_attribute("max", 100),
        );
        store.set(
            "valve/trv",
            EntityState::new("heat").with_attribute("temperature", 15.0),
        );
        let trv = TrvSettings::default();
        let mut actuator = DeviceActuator::new(0.1);

        actuator
            .drive_valve(&store, "valve/pos", Demand::Heat, 21.0, &trv)
            .unwrap();
        actuator
            .drive_valve(&store, "valve/trv", Demand::Heat, 21.0, &trv)
            .unwrap();
        actuator
            .drive_valve(&store, "valve/trv", Demand::Idle, 21.0, &trv)
            .unwrap();

        assert_eq!(
            store.commands_for("valve/pos"),
            vec![DeviceCommand::SetPosition { position: 100.0 }]
        );
        assert_eq!(
            store.commands_for("valve/trv"),
            vec![
                DeviceCommand::SetTemperature { temperature: 25.0 },
                DeviceCommand::SetTemperature { temperature: 10.0 },
            ]
        );
    }

    #[test]
    fn switch_commands_only_on_change() {
        let store = MemoryStateStore::new();
        store.set_value("pump", "on");
        let mut actuator = DeviceActuator::new(0.1);

        assert!(!actuator.set_switch(&store, "pump", true).unwrap());
        assert!(actuator.set_switch(&store, "pump", false).unwrap());
        assert_eq!(store.commands(), vec![("pump".to_string(), DeviceCommand::TurnOff)]);
    }
}
