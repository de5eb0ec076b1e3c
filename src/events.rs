use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// A detected object in monitor-output coordinates.
///
/// Region values are percent units scaled by 100 (0..10000), so they stay
/// meaningful regardless of the resolution the detector ran at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub label: String,
    pub score: f64,
    pub region: Region,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub rect: RegionRect,
}

/// top, left, bottom, right in percent units (0..10000)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionRect {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
}

/// A recording trigger produced by the detection bridge.
///
/// `duration` is the pre-roll the recorder prepends; `rec_duration` is how
/// long the recording runs after the event. A second event inside the
/// window extends it instead of starting a new recording.
#[derive(Debug, Clone)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub detections: Vec<Detection>,
    pub duration: Duration,
    pub rec_duration: Duration,
}

/// Sending half of a monitor's trigger channel
pub type Trigger = mpsc::Sender<Event>;

/// Receiving half of a monitor's trigger channel
pub type TriggerReceiver = mpsc::Receiver<Event>;

/// Trigger channel with enough slack for bursts of detections
pub fn trigger_channel() -> (Trigger, TriggerReceiver) {
    mpsc::channel(16)
}
