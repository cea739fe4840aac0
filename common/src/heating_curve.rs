//! Weather-compensated flow temperature with a self-tuning coefficient.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::HeatingSystemType;

/// Setpoints at or below this are sensor/compressor noise and never tune the curve.
pub const MINIMUM_SETPOINT: f32 = 10.0;
const HISTORY_LEN: usize = 5;
const DEFAULT_COEFFICIENT: f32 = 1.0;

/// Persisted tuning state, restorable across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatingCurveState {
    pub coefficient: f32,
    pub optimal_coefficient: Option<f32>,
    pub derivative: Option<f32>,
    pub history: Vec<f32>,
}

impl Default for HeatingCurveState {
    fn default() -> Self {
        Self {
            coefficient: DEFAULT_COEFFICIENT,
            optimal_coefficient: None,
            derivative: None,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeatingCurve {
    system: HeatingSystemType,
    coefficient: f32,
    optimal_coefficient: Option<f32>,
    derivative: Option<f32>,
    history: VecDeque<f32>,
    value: Option<f32>,
}

impl HeatingCurve {
    pub fn new(system: HeatingSystemType, coefficient: f32) -> Self {
        Self {
            system,
            coefficient,
            optimal_coefficient: None,
            derivative: None,
            history: VecDeque::with_capacity(HISTORY_LEN),
            value: None,
        }
    }

    pub fn restore(system: HeatingSystemType, state: &HeatingCurveState) -> Self {
        let mut curve = Self::new(system, state.coefficient);
        curve.optimal_coefficient = state.optimal_coefficient;
        curve.derivative = state.derivative;
        let skip = state.history.len().saturating_sub(HISTORY_LEN);
        curve.history.extend(state.history.iter().skip(skip).copied());
        curve
    }

    pub fn state(&self) -> HeatingCurveState {
        HeatingCurveState {
            coefficient: self.coefficient,
            optimal_coefficient: self.optimal_coefficient,
            derivative: self.derivative,
            history: self.history.iter().copied().collect(),
        }
    }

    pub fn system(&self) -> HeatingSystemType {
        self.system
    }

    pub fn set_system(&mut self, system: HeatingSystemType) {
        self.system = system;
    }

    pub fn coefficient(&self) -> f32 {
        self.coefficient
    }

    pub fn set_coefficient(&mut self, coefficient: f32) {
        self.coefficient = coefficient;
    }

    pub fn optimal_coefficient(&self) -> Option<f32> {
        self.optimal_coefficient
    }

    pub fn derivative(&self) -> Option<f32> {
        self.derivative
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    pub fn base_offset(&self) -> f32 {
        match self.system {
            HeatingSystemType::Underfloor => 40.0,
            HeatingSystemType::Radiator => 55.0,
        }
    }

    pub fn calculate(target: f32, outside: f32) -> f32 {
        let delta = outside - 20.0;
        4.0 * (target - 20.0) + 0.03 * delta * delta - 0.4 * delta
    }

    pub fn update(&mut self, target: f32, outside: f32) -> f32 {
        let value = round1(
            self.base_offset() + (self.coefficient / 4.0) * Self::calculate(target, outside),
        );
        self.value = Some(value);
        value
    }

    /// Coefficient that would make `update` yield `setpoint`.
    pub fn calculate_coefficient(&self, setpoint: f32, target: f32, outside: f32) -> f32 {
        let curve = Self::calculate(target, outside);
        if curve == 0.0 {
            return self.coefficient;
        }
        round1(4.0 * (setpoint - self.base_offset()) / curve)
    }

    pub fn autotune(&mut self, setpoint: f32, target: f32, outside: f32) -> Option<f32> {
        if setpoint <= MINIMUM_SETPOINT {
            return None;
        }

        let mut candidate = self.calculate_coefficient(setpoint, target, outside);

        if let Some(previous) = self.optimal_coefficient {
            let derivative = candidate - previous;
            self.derivative = Some(derivative);
            candidate += correction(derivative);
        }

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(candidate);

        let mean = self.history.iter().sum::<f32>() / self.history.len() as f32;
        let optimal = round1(mean);
        self.optimal_coefficient = Some(optimal);
        Some(optimal)
    }
}

// Damped nudge against the direction the coefficient just moved.
fn correction(derivative: f32) -> f32 {
    let magnitude = derivative.abs();
    let step = if magnitude < 1.0 {
        0.1
    } else if magnitude < 2.0 {
        0.2
    } else {
        0.3
    };

    if derivative > 0.0 {
        -step
    } else if derivative < 0.0 {
        step
    } else {
        0.0
    }
}

pub(crate) fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}
