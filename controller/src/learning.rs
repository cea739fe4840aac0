use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use heating_common::LearningEngine;

const MAX_SAMPLES: usize = 10;
/// Events shorter than this or rising less than `MIN_RISE_C` say nothing about the room.
const MIN_EVENT_MINUTES: f32 = 5.0;
const MIN_RISE_C: f32 = 0.1;

/// Persisted warm-up rates in °C per minute, newest last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningData {
    pub rates: HashMap<String, Vec<f32>>,
}

#[derive(Debug, Clone, Copy)]
struct OpenEvent {
    started_at: DateTime<Utc>,
    start_temp: f32,
}

#[derive(Debug, Default)]
struct Inner {
    open: HashMap<String, OpenEvent>,
    rates: HashMap<String, VecDeque<f32>>,
    dirty: bool,
}

/// Predicts warm-up time from the average of the last observed heating rates.
#[derive(Debug, Default)]
pub struct RateLearning {
    inner: Mutex<Inner>,
}

impl RateLearning {
    pub fn from_data(data: LearningData) -> Self {
        let rates = data
            .rates
            .into_iter()
            .map(|(zone, samples)| {
                let skip = samples.len().saturating_sub(MAX_SAMPLES);
                let samples = samples
                    .into_iter()
                    .skip(skip)
                    .filter(|rate| rate.is_finite() && *rate > 0.0)
                    .collect();
                (zone, samples)
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                rates,
                ..Inner::default()
            }),
        }
    }

    /// Current data, if anything changed since the last call.
    pub fn take_dirty(&self) -> Option<LearningData> {
        let mut inner = self.inner.lock().ok()?;
        if !inner.dirty {
            return None;
        }
        inner.dirty = false;
        Some(LearningData {
            rates: inner
                .rates
                .iter()
                .map(|(zone, samples)| (zone.clone(), samples.iter().copied().collect()))
                .collect(),
        })
    }

    pub fn average_rate(&self, zone_id: &str) -> Option<f32> {
        let inner = self.inner.lock().ok()?;
        let samples = inner.rates.get(zone_id)?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f32>() / samples.len() as f32)
    }

    pub fn start_at(&self, zone_id: &str, current_temp: f32, now: DateTime<Utc>) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!("learning state poisoned");
            return;
        };
        inner.open.insert(
            zone_id.to_string(),
            OpenEvent {
                started_at: now,
                start_temp: current_temp,
            },
        );
    }

    pub fn end_at(&self, zone_id: &str, current_temp: f32, now: DateTime<Utc>) {
        let Ok(mut inner) = self.inner.lock() else {
            warn!("learning state poisoned");
            return;
        };
        let Some(event) = inner.open.remove(zone_id) else {
            return;
        };

        let minutes = (now - event.started_at).num_seconds() as f32 / 60.0;
        let rise = current_temp - event.start_temp;
        if minutes < MIN_EVENT_MINUTES || rise < MIN_RISE_C {
            debug!(zone = zone_id, minutes, rise, "heating event too small to learn from");
            return;
        }

        let rate = rise / minutes;
        let samples = inner.rates.entry(zone_id.to_string()).or_default();
        samples.push_back(rate);
        while samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
        inner.dirty = true;
        debug!(zone = zone_id, rate, "heating rate recorded");
    }
}

impl LearningEngine for RateLearning {
    fn predict_heating_minutes(
        &self,
        zone_id: &str,
        current_temp: f32,
        target_temp: f32,
        _outdoor_temp: Option<f32>,
    ) -> Option<u32> {
        let rate = self.average_rate(zone_id)?;
        let delta = target_temp - current_temp;
        if delta <= 0.0 {
            return Some(0);
        }
        Some((delta / rate).ceil() as u32)
    }

    fn start_heating_event(&self, zone_id: &str, current_temp: f32) {
        self.start_at(zone_id, current_temp, Utc::now());
    }

    fn end_heating_event(&self, zone_id: &str, current_temp: f32) {
        self.end_at(zone_id, current_temp, Utc::now());
    }
}
