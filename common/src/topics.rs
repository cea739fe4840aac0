//! MQTT topic layout under a configurable prefix (`heating` by default).
//!
//! - `<prefix>/state/<entity>`: retained device/sensor state, published by bridges
//! - `<prefix>/cmnd/<entity>`: commands this controller issues
//! - `<prefix>/zones/<zone>/state`: zone status
//! - `<prefix>/zones/<zone>/set`: zone commands (JSON, `{"command": ...}`)
//! - `<prefix>/events`: zone events
//! - `<prefix>/controller/state`: controller summary

pub const STATE_SEGMENT: &str = "state";
pub const COMMAND_SEGMENT: &str = "cmnd";

pub fn entity_state_filter(prefix: &str) -> String {
    format!("{prefix}/{STATE_SEGMENT}/#")
}

pub fn entity_state(prefix: &str, entity: &str) -> String {
    format!("{prefix}/{STATE_SEGMENT}/{entity}")
}

pub fn entity_command(prefix: &str, entity: &str) -> String {
    format!("{prefix}/{COMMAND_SEGMENT}/{entity}")
}

pub fn zone_state(prefix: &str, zone_id: &str) -> String {
    format!("{prefix}/zones/{zone_id}/state")
}

pub fn zone_command_filter(prefix: &str) -> String {
    format!("{prefix}/zones/+/set")
}

pub fn zone_command(prefix: &str, zone_id: &str) -> String {
    format!("{prefix}/zones/{zone_id}/set")
}

/// Zone id carried by a zone command topic, if the topic is one.
pub fn zone_from_command_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let zone = topic
        .strip_prefix(prefix)?
        .strip_prefix("/zones/")?
        .strip_suffix("/set")?;
    (!zone.is_empty() && !zone.contains('/')).then_some(zone)
}

pub fn events(prefix: &str) -> String {
    format!("{prefix}/events")
}

pub fn controller_state(prefix: &str) -> String {
    format!("{prefix}/controller/state")
}

/// Entity id carried by a state topic, if the topic is one.
pub fn entity_from_state_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let entity = topic
        .strip_prefix(prefix)?
        .strip_prefix('/')?
        .strip_prefix(STATE_SEGMENT)?
        .strip_prefix('/')?;
    (!entity.is_empty()).then_some(entity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_topics_round_trip_entities() {
        let topic = entity_state("heating", "z2m/living-trv");
        assert_eq!(topic, "heating/state/z2m/living-trv");
        assert_eq!(
            entity_from_state_topic("heating", &topic),
            Some("z2m/living-trv")
        );
        assert_eq!(entity_from_state_topic("heating", "heating/cmnd/x"), None);
        assert_eq!(entity_from_state_topic("heating", "heating/state/"), None);
        assert_eq!(entity_from_state_topic("heating", "other/state/x"), None);
    }

    #[test]
    fn zone_command_topics() {
        assert_eq!(zone_command_filter("heating"), "heating/zones/+/set");
        let topic = zone_command("heating", "living");
        assert_eq!(zone_from_command_topic("heating", &topic), Some("living"));
        assert_eq!(zone_from_command_topic("heating", "heating/zones/living/state"), None);
        assert_eq!(zone_from_command_topic("heating", "heating/zones/a/b/set"), None);
    }
}
