use std::{collections::HashMap, sync::RwLock};

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, QoS};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use heating_common::{
    topics, DeviceCommand, EntityState, EventSink, HeatingError, StateStore, ZoneEvent,
};

/// Entity states mirrored from `<prefix>/state/#`; commands go out on `<prefix>/cmnd/<entity>`.
pub struct MqttStateStore {
    client: AsyncClient,
    prefix: String,
    states: RwLock<HashMap<String, EntityState>>,
}

impl MqttStateStore {
    pub fn new(client: AsyncClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the entity id when the topic was a state topic.
    pub fn ingest(&self, topic: &str, payload: &str, now: DateTime<Utc>) -> Option<String> {
        let entity = topics::entity_from_state_topic(&self.prefix, topic)?;
        let state = parse_state_payload(payload).updated_at(now);
        match self.states.write() {
            Ok(mut states) => {
                states.insert(entity.to_string(), state);
            }
            Err(err) => {
                warn!("state cache poisoned, dropping update for {entity}: {err}");
                return None;
            }
        }
        Some(entity.to_string())
    }

    pub fn entity_count(&self) -> usize {
        self.states.read().map(|states| states.len()).unwrap_or(0)
    }
}

impl StateStore for MqttStateStore {
    fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.read().ok()?.get(entity_id).cloned()
    }

    fn command(&self, entity_id: &str, command: &DeviceCommand) -> heating_common::Result<()> {
        let payload = serde_json::to_vec(command)
            .map_err(|err| HeatingError::actuation(entity_id, err.to_string()))?;
        let topic = topics::entity_command(&self.prefix, entity_id);
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|err| HeatingError::actuation(entity_id, err.to_string()))?;
        debug!(entity = entity_id, action = command.action(), "command published");
        Ok(())
    }
}

/// Plain values (`21.5`, `on`) or a JSON object carrying `state`/`value` plus attributes.
pub fn parse_state_payload(payload: &str) -> EntityState {
    let trimmed = payload.trim();
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) else {
        return EntityState::new(trimmed);
    };

    let mut attributes = Map::new();
    let mut value = None;
    let mut unit = None;
    for (key, item) in object {
        match key.as_str() {
            "state" | "value" if value.is_none() => value = Some(scalar_text(&item)),
            "unit" | "unit_of_measurement" => unit = item.as_str().map(str::to_string),
            _ => {
                attributes.insert(key, item);
            }
        }
    }

    let mut state = EntityState::new(value.unwrap_or_else(|| "unknown".to_string()));
    state.attributes = attributes;
    state.unit = unit;
    state
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bool(true) => "on".to_string(),
        Value::Bool(false) => "off".to_string(),
        Value::Null => "unknown".to_string(),
        other => other.to_string(),
    }
}

/// Logs every zone event and forwards it to `<prefix>/events`.
pub struct MqttEventSink {
    client: AsyncClient,
    topic: String,
}

impl MqttEventSink {
    pub fn new(client: AsyncClient, prefix: &str) -> Self {
        Self {
            client,
            topic: topics::events(prefix),
        }
    }
}

impl EventSink for MqttEventSink {
    fn emit(&self, event: &ZoneEvent) {
        info!(zone = %event.zone_id, category = ?event.category, "{}", event.message);
        match serde_json::to_vec(event) {
            Ok(payload) => {
                if let Err(err) =
                    self.client
                        .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
                {
                    warn!("event publish failed: {err}");
                }
            }
            Err(err) => warn!("event serialization failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rumqttc::{EventLoop, MqttOptions};

    use super::*;

    // The event loop owns the request queue; keep it alive for the test's duration.
    fn store() -> (MqttStateStore, EventLoop) {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 8);
        (MqttStateStore::new(client, "heating"), eventloop)
    }

    #[test]
    fn parses_plain_and_json_payloads() {
        let plain = parse_state_payload(" 21.5 ");
        assert_eq!(plain.value, "21.5");
        assert!(plain.attributes.is_empty());

        let json = parse_state_payload(
            r#"{"state":"heat","current_temperature":19.5,"hvac_modes":["heat","off"],"unit":"°C"}"#,
        );
        assert_eq!(json.value, "heat");
        assert_eq!(json.unit.as_deref(), Some("°C"));
        assert_eq!(json.attribute_f32("current_temperature"), Some(19.5));
        assert!(json.attributes.contains_key("hvac_modes"));

        assert_eq!(parse_state_payload(r#"{"value":true}"#).value, "on");
        assert_eq!(parse_state_payload(r#"{"battery":80}"#).value, "unknown");
    }

    #[test]
    fn ingest_only_accepts_state_topics() {
        let (store, _eventloop) = store();
        let now = Utc::now();

        assert_eq!(
            store.ingest("heating/state/sensor/living", "20.5", now),
            Some("sensor/living".to_string())
        );
        assert_eq!(store.ingest("heating/cmnd/sensor/living", "1", now), None);

        let state = store.get_state("sensor/living").unwrap();
        assert_eq!(state.numeric_value(), Some(20.5));
        assert_eq!(state.last_updated, Some(now));
        assert_eq!(store.entity_count(), 1);
    }

    #[test]
    fn commands_are_queued_without_waiting() {
        let (store, _eventloop) = store();
        store
            .command("climate/living", &DeviceCommand::SetTemperature { temperature: 21.0 })
            .unwrap();
    }
}
