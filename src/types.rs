//! Core types for the Bedside Flux engine
//!
//! This module defines the data that flows between stages: decoded sensor
//! frames, per-side sample slices, capacitance baselines, presence states, and
//! the vitals and sleep records handed to persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bed side. The pad carries one independent sensor set per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Left, Side::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            other => Err(format!("unknown side '{}', expected left or right", other)),
        }
    }
}

/// One second of piezo samples for both sides (`piezo-dual` record)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiezoFrame {
    /// Epoch seconds
    pub ts: i64,
    /// Sample rate in Hz
    #[serde(default = "default_piezo_freq")]
    pub freq: u32,
    #[serde(default)]
    pub adc: i64,
    #[serde(default)]
    pub gain: i64,
    pub left1: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left2: Option<Vec<i32>>,
    pub right1: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right2: Option<Vec<i32>>,
    #[serde(default)]
    pub seq: u64,
}

fn default_piezo_freq() -> u32 {
    500
}

impl PiezoFrame {
    /// Number of piezo channels per side carried by this frame (1 or 2)
    pub fn sensor_count(&self) -> usize {
        if self.left2.is_some() && self.right2.is_some() {
            2
        } else {
            1
        }
    }

    /// Borrow channel `number` (1 or 2) of `side`
    pub fn channel(&self, side: Side, number: u8) -> Option<&[i32]> {
        match (side, number) {
            (Side::Left, 1) => Some(&self.left1),
            (Side::Left, 2) => self.left2.as_deref(),
            (Side::Right, 1) => Some(&self.right1),
            (Side::Right, 2) => self.right2.as_deref(),
            _ => None,
        }
    }

    /// Move the channel arrays out into one [`SideSamples`] per side
    pub fn into_sides(self) -> (SideSamples, SideSamples) {
        (
            SideSamples {
                ts: self.ts,
                primary: self.left1,
                secondary: self.left2,
            },
            SideSamples {
                ts: self.ts,
                primary: self.right1,
                secondary: self.right2,
            },
        )
    }

    /// Mean of channel 1 for `side`, used by presence classification
    pub fn primary_mean(&self, side: Side) -> Option<f64> {
        let samples = self.channel(side, 1)?;
        if samples.is_empty() {
            return None;
        }
        let sum: f64 = samples.iter().map(|&v| v as f64).sum();
        Some(sum / samples.len() as f64)
    }
}

/// One second of piezo samples for a single side
#[derive(Debug, Clone, PartialEq)]
pub struct SideSamples {
    pub ts: i64,
    pub primary: Vec<i32>,
    pub secondary: Option<Vec<i32>>,
}

/// Capacitance readings for one side
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapChannels {
    pub out: f64,
    pub cen: f64,
    #[serde(rename = "in")]
    pub inner: f64,
}

impl CapChannels {
    pub fn get(&self, channel: CapChannel) -> f64 {
        match channel {
            CapChannel::Out => self.out,
            CapChannel::Cen => self.cen,
            CapChannel::In => self.inner,
        }
    }
}

/// Capacitance readings for one side as decoded, including the sensor status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapReading {
    #[serde(flatten)]
    pub channels: CapChannels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// One capacitance sample for both sides (`capSense` record)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapFrame {
    pub ts: i64,
    pub left: CapReading,
    pub right: CapReading,
    #[serde(default)]
    pub seq: u64,
}

impl CapFrame {
    pub fn side(&self, side: Side) -> &CapReading {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

/// A decoded record from the pad's sensor log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SensorFrame {
    #[serde(rename = "piezo-dual")]
    Piezo(PiezoFrame),
    #[serde(rename = "capSense")]
    Cap(CapFrame),
}

impl SensorFrame {
    pub fn ts(&self) -> i64 {
        match self {
            SensorFrame::Piezo(frame) => frame.ts,
            SensorFrame::Cap(frame) => frame.ts,
        }
    }
}

/// Capacitance channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapChannel {
    Out,
    Cen,
    In,
}

impl CapChannel {
    pub const ALL: [CapChannel; 3] = [CapChannel::Out, CapChannel::Cen, CapChannel::In];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapChannel::Out => "out",
            CapChannel::Cen => "cen",
            CapChannel::In => "in",
        }
    }
}

/// Mean/std pair of a capacitance channel measured while the bed was empty
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelBaseline {
    pub mean: f64,
    pub std: f64,
}

impl ChannelBaseline {
    /// Standard score of `value` against this baseline
    pub fn z_score(&self, value: f64) -> f64 {
        (value - self.mean) / self.std
    }
}

/// Per-channel capacitance baseline for one side
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapBaseline {
    pub out: ChannelBaseline,
    pub cen: ChannelBaseline,
    #[serde(rename = "in")]
    pub inner: ChannelBaseline,
}

impl CapBaseline {
    pub fn channel(&self, channel: CapChannel) -> &ChannelBaseline {
        match channel {
            CapChannel::Out => &self.out,
            CapChannel::Cen => &self.cen,
            CapChannel::In => &self.inner,
        }
    }

    /// Sum of per-channel z-scores for a reading
    pub fn combined_z(&self, reading: &CapChannels) -> f64 {
        CapChannel::ALL
            .iter()
            .map(|&c| self.channel(c).z_score(reading.get(c)))
            .sum()
    }
}

/// Merged per-second row used by presence classification and calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceSample {
    pub ts: i64,
    /// Mean of piezo channel 1 over the second
    pub piezo_mean: f64,
    pub cap: CapChannels,
}

/// Occupancy of one side at one timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub ts: i64,
    pub piezo_present: bool,
    pub cap_present: bool,
    /// Momentary-present piezo flags in the current rolling window
    pub piezo_count: usize,
    /// Momentary-occupied capacitance flags in the current rolling window
    pub cap_count: usize,
}

impl PresenceState {
    /// Combined occupancy: number of modalities reporting presence (0, 1 or 2)
    pub fn combined(&self) -> u8 {
        self.piezo_present as u8 + self.cap_present as u8
    }

    /// Occupied for sleep purposes only when both modalities agree
    pub fn occupied(&self) -> bool {
        self.combined() == 2
    }

    pub fn to_occupancy(&self) -> OccupancySample {
        OccupancySample {
            ts: self.ts,
            occupancy: self.combined(),
        }
    }
}

/// One point of a combined-occupancy time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancySample {
    pub ts: i64,
    pub occupancy: u8,
}

impl OccupancySample {
    pub fn occupied(&self) -> bool {
        self.occupancy == 2
    }
}

/// Closed time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}

/// A merged sleep session for one side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepRecord {
    pub side: Side,
    pub entered_bed_at: DateTime<Utc>,
    pub left_bed_at: DateTime<Utc>,
    /// Accumulated present time, excluding the gaps between merged intervals
    pub sleep_period_seconds: i64,
    pub times_exited_bed: u32,
    pub present_intervals: Vec<Interval>,
    pub not_present_intervals: Vec<Interval>,
}

/// Periodic vitals summary for one side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalsRecord {
    pub side: Side,
    /// Epoch seconds
    pub timestamp: i64,
    /// Beats per minute
    pub heart_rate: f64,
    /// sdnn in milliseconds, if a valid estimate exists
    pub hrv: Option<f64>,
    /// Breaths per minute, if a valid estimate exists
    pub breathing_rate: Option<f64>,
}

impl VitalsRecord {
    /// Integer form used by persistence: values floored, missing or NaN as 0
    pub fn floored(&self) -> StoredVitals {
        StoredVitals {
            side: self.side,
            timestamp: self.timestamp,
            heart_rate: floor_or_zero(Some(self.heart_rate)),
            hrv: floor_or_zero(self.hrv),
            breathing_rate: floor_or_zero(self.breathing_rate),
        }
    }
}

/// Vitals as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVitals {
    pub side: Side,
    pub timestamp: i64,
    pub heart_rate: i64,
    pub hrv: i64,
    pub breathing_rate: i64,
}

fn floor_or_zero(value: Option<f64>) -> i64 {
    match value {
        Some(v) if v.is_finite() => v.floor() as i64,
        _ => 0,
    }
}

/// Convert epoch seconds to UTC, clamping unrepresentable values to the epoch
pub fn epoch_to_utc(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_piezo_frame_deserialization() {
        let json = r#"{
            "type": "piezo-dual",
            "ts": 1736506822,
            "freq": 500,
            "adc": 1,
            "gain": 400,
            "left1": [-160889, -163532],
            "left2": [-4788, -4841],
            "right1": [544338, 543290],
            "right2": [722955, 723792],
            "seq": 1610681
        }"#;

        let frame: SensorFrame = serde_json::from_str(json).unwrap();
        match frame {
            SensorFrame::Piezo(piezo) => {
                assert_eq!(piezo.ts, 1736506822);
                assert_eq!(piezo.sensor_count(), 2);
                assert_eq!(piezo.channel(Side::Right, 2), Some(&[722955, 723792][..]));
            }
            other => panic!("expected piezo frame, got {:?}", other),
        }
    }

    #[test]
    fn test_single_sensor_frame() {
        let json = r#"{"type":"piezo-dual","ts":10,"left1":[1,2,3],"right1":[4,5,6]}"#;
        let frame: SensorFrame = serde_json::from_str(json).unwrap();
        let SensorFrame::Piezo(piezo) = frame else {
            panic!("expected piezo frame");
        };
        assert_eq!(piezo.freq, 500);
        assert_eq!(piezo.sensor_count(), 1);
        assert_eq!(piezo.channel(Side::Left, 2), None);
        assert!((piezo.primary_mean(Side::Right).unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_cap_frame_deserialization() {
        let json = r#"{
            "type": "capSense",
            "ts": 1736506822,
            "left": {"out": 387, "cen": 381, "in": 505, "status": "good"},
            "right": {"out": 1076, "cen": 1075, "in": 1074, "status": "good"},
            "seq": 1610679
        }"#;

        let frame: SensorFrame = serde_json::from_str(json).unwrap();
        let SensorFrame::Cap(cap) = frame else {
            panic!("expected cap frame");
        };
        assert_eq!(cap.side(Side::Left).channels.inner, 505.0);
        assert_eq!(cap.side(Side::Right).status.as_deref(), Some("good"));
    }

    #[test]
    fn test_combined_z() {
        let baseline = CapBaseline {
            out: ChannelBaseline { mean: 100.0, std: 5.0 },
            cen: ChannelBaseline { mean: 200.0, std: 10.0 },
            inner: ChannelBaseline { mean: 300.0, std: 5.0 },
        };
        let reading = CapChannels {
            out: 110.0,
            cen: 210.0,
            inner: 295.0,
        };
        // 2 + 1 - 1
        assert!((baseline.combined_z(&reading) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_vitals_flooring() {
        let record = VitalsRecord {
            side: Side::Left,
            timestamp: 100,
            heart_rate: 61.9,
            hrv: Some(f64::NAN),
            breathing_rate: Some(14.7),
        };
        assert_eq!(
            record.floored(),
            StoredVitals {
                side: Side::Left,
                timestamp: 100,
                heart_rate: 61,
                hrv: 0,
                breathing_rate: 14,
            }
        );
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!("LEFT".parse::<Side>().unwrap(), Side::Left);
        assert!("middle".parse::<Side>().is_err());
    }
}
