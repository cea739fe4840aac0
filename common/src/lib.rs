pub mod actuator;
pub mod config;
pub mod engine;
pub mod error;
pub mod heating_curve;
pub mod ports;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod snapshot;
pub mod system;
pub mod temperature;
pub mod topics;
pub mod types;
pub mod zone;

#[cfg(test)]
mod testing;

pub use actuator::{Demand, DeviceActuator, DeviceCapability};
pub use config::{ControllerConfig, GlobalSettings, NetworkConfig, RuntimeConfig};
pub use engine::{CycleReport, ZoneControlEngine, ZoneOutcome};
pub use error::{HeatingError, Result};
pub use heating_curve::{HeatingCurve, HeatingCurveState};
pub use ports::{
    Collaborators, DeviceCommand, EntityState, EventCategory, EventSink, LearningEngine,
    NoLearning, StateStore, ZoneEvent,
};
pub use registry::ZoneRegistry;
pub use schedule::{ClockTime, DayOfWeek, Schedule, ScheduleTarget};
pub use scheduler::ScheduleEvaluator;
pub use system::{HeatingSystem, ZoneCommand};
pub use types::{HvacMode, PresetMode, ZoneState, ZoneStatus};
pub use zone::Zone;
