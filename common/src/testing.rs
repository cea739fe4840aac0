//! In-memory port implementations for unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use crate::{
    error::{HeatingError, Result},
    ports::{
        Collaborators, DeviceCommand, EntityState, EventSink, LearningEngine, StateStore,
        ZoneEvent,
    },
};

#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, EntityState>>,
    failing: Mutex<HashSet<String>>,
    commands: Mutex<Vec<(String, DeviceCommand)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity: &str, state: EntityState) {
        self.states
            .lock()
            .unwrap()
            .insert(entity.to_string(), state);
    }

    pub fn set_value(&self, entity: &str, value: &str) {
        self.set(entity, EntityState::new(value));
    }

    pub fn fail(&self, entity: &str) {
        self.failing.lock().unwrap().insert(entity.to_string());
    }

    pub fn commands(&self) -> Vec<(String, DeviceCommand)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_for(&self, entity: &str) -> Vec<DeviceCommand> {
        self.commands()
            .into_iter()
            .filter(|(target, _)| target == entity)
            .map(|(_, command)| command)
            .collect()
    }

    pub fn last_command(&self, entity: &str) -> Option<DeviceCommand> {
        self.commands_for(entity).pop()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().unwrap().clear();
    }
}

impl StateStore for MemoryStateStore {
    fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.lock().unwrap().get(entity_id).cloned()
    }

    fn command(&self, entity_id: &str, command: &DeviceCommand) -> Result<()> {
        if self.failing.lock().unwrap().contains(entity_id) {
            return Err(HeatingError::actuation(entity_id, "device offline"));
        }
        self.commands
            .lock()
            .unwrap()
            .push((entity_id.to_string(), *command));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<ZoneEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<ZoneEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingEvents {
    fn emit(&self, event: &ZoneEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Default)]
pub struct FixedLearning {
    pub minutes: Option<u32>,
    calls: Mutex<Vec<(String, &'static str, f32)>>,
}

impl FixedLearning {
    pub fn predicting(minutes: u32) -> Self {
        Self {
            minutes: Some(minutes),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, &'static str, f32)> {
        self.calls.lock().unwrap().clone()
    }
}

impl LearningEngine for FixedLearning {
    fn predict_heating_minutes(&self, _: &str, _: f32, _: f32, _: Option<f32>) -> Option<u32> {
        self.minutes
    }

    fn start_heating_event(&self, zone_id: &str, current_temp: f32) {
        self.calls
            .lock()
            .unwrap()
            .push((zone_id.to_string(), "start", current_temp));
    }

    fn end_heating_event(&self, zone_id: &str, current_temp: f32) {
        self.calls
            .lock()
            .unwrap()
            .push((zone_id.to_string(), "end", current_temp));
    }
}

/// Store, learning engine and event recorder bundled for a test.
#[derive(Default)]
pub struct Harness {
    pub store: MemoryStateStore,
    pub learning: FixedLearning,
    pub events: RecordingEvents,
}

impl Harness {
    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            store: &self.store,
            learning: &self.learning,
            events: &self.events,
        }
    }
}
