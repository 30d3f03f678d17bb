//! Empty-bed capacitance baselines
//!
//! Capacitance presence is judged by z-scores against a per-side baseline
//! measured while nobody is on the bed. [`BaselineCalibrator`] finds such a
//! quiet window in recorded data; a [`BaselineStore`] persists the result so
//! the live pipeline can load it at startup.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};

use crate::config::CalibrationConfig;
use crate::dsp::stats;
use crate::error::EngineError;
use crate::presence::centered_ranges;
use crate::types::{CapBaseline, CapChannel, CapChannels, ChannelBaseline, PresenceSample, Side};

/// Per-second row scanned for a quiet window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSample {
    pub ts: i64,
    /// Centred piezo range; `None` near the series edges
    pub piezo_range: Option<f64>,
    pub cap: CapChannels,
}

/// Attach the centred piezo range to merged presence samples
pub fn calibration_samples(samples: &[PresenceSample], range_window: usize) -> Vec<CalibrationSample> {
    let means: Vec<f64> = samples.iter().map(|s| s.piezo_mean).collect();
    samples
        .iter()
        .zip(centered_ranges(&means, range_window))
        .map(|(s, piezo_range)| CalibrationSample {
            ts: s.ts,
            piezo_range,
            cap: s.cap,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct BaselineCalibrator {
    config: CalibrationConfig,
}

impl BaselineCalibrator {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Baseline from the first quiet window of `samples` (sorted by timestamp)
    pub fn find(&self, side: Side, samples: &[CalibrationSample]) -> Result<CapBaseline, EngineError> {
        let window = self
            .find_window(samples)
            .ok_or(EngineError::CalibrationNotFound(side))?;
        let baseline = self.baseline_from(window);
        info!(
            "{} side baseline from {} samples starting {}",
            side,
            window.len(),
            window.first().map_or(0, |s| s.ts)
        );
        Ok(baseline)
    }

    /// First non-overlapping window, anchored at the first sample, in which
    /// the piezo stays quiet and every capacitance channel is stable
    pub fn find_window<'a>(&self, samples: &'a [CalibrationSample]) -> Option<&'a [CalibrationSample]> {
        let width = self.config.window_seconds.max(1);
        let origin = samples.first()?.ts;

        let mut start = 0;
        while start < samples.len() {
            let window_index = (samples[start].ts - origin) / width;
            let window_end = origin + (window_index + 1) * width;
            let len = samples[start..]
                .iter()
                .take_while(|s| s.ts < window_end)
                .count()
                .max(1);
            let window = &samples[start..start + len];
            start += len;

            if window.len() < 2 {
                continue;
            }
            if self.is_quiet(window) {
                return Some(window);
            }
        }

        debug!("no quiet window among {} samples", samples.len());
        None
    }

    fn is_quiet(&self, window: &[CalibrationSample]) -> bool {
        let max_range = window
            .iter()
            .filter_map(|s| s.piezo_range)
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))));
        if max_range.is_some_and(|r| r >= self.config.threshold_range) {
            return false;
        }

        CapChannel::ALL.iter().all(|&channel| {
            let values: Vec<f64> = window.iter().map(|s| s.cap.get(channel)).collect();
            coefficient_of_variation(&values) <= self.config.max_cv
        })
    }

    /// Mean and floored sample std of each capacitance channel
    pub fn baseline_from(&self, window: &[CalibrationSample]) -> CapBaseline {
        let channel = |c: CapChannel| {
            let values: Vec<f64> = window.iter().map(|s| s.cap.get(c)).collect();
            let std = stats::sample_std_dev(&values);
            ChannelBaseline {
                mean: stats::mean(&values),
                std: if std.is_nan() {
                    self.config.min_std
                } else {
                    std.max(self.config.min_std)
                },
            }
        };
        CapBaseline {
            out: channel(CapChannel::Out),
            cen: channel(CapChannel::Cen),
            inner: channel(CapChannel::In),
        }
    }
}

/// Sample std over mean; zero when the mean is zero
fn coefficient_of_variation(values: &[f64]) -> f64 {
    let mean = stats::mean(values);
    if mean == 0.0 {
        return 0.0;
    }
    stats::sample_std_dev(values) / mean
}

/// Persistence for per-side baselines
pub trait BaselineStore: Send + Sync {
    /// Baseline for `side`; [`EngineError::CalibrationNotFound`] if never saved
    fn load(&self, side: Side) -> Result<CapBaseline, EngineError>;

    fn save(&self, side: Side, baseline: &CapBaseline) -> Result<(), EngineError>;
}

/// `{side}_cap_baseline.json` files in a directory.
///
/// Each file maps `{side}_out`, `{side}_cen` and `{side}_in` to `{mean, std}`.
#[derive(Debug, Clone)]
pub struct JsonFileBaselineStore {
    dir: PathBuf,
}

impl JsonFileBaselineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, side: Side) -> PathBuf {
        self.dir.join(format!("{}_cap_baseline.json", side))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize `baseline` in the on-disk layout
    pub fn to_json(side: Side, baseline: &CapBaseline) -> Result<String, EngineError> {
        let map: BTreeMap<String, ChannelBaseline> = CapChannel::ALL
            .iter()
            .map(|&c| (channel_key(side, c), *baseline.channel(c)))
            .collect();
        Ok(serde_json::to_string_pretty(&map)?)
    }

    /// Parse the on-disk layout for `side`
    pub fn from_json(side: Side, json: &str) -> Result<CapBaseline, EngineError> {
        let map: HashMap<String, ChannelBaseline> = serde_json::from_str(json)?;
        let channel = |c: CapChannel| {
            let key = channel_key(side, c);
            map.get(&key)
                .copied()
                .ok_or_else(|| EngineError::InvalidFrame(format!("baseline is missing '{}'", key)))
        };
        Ok(CapBaseline {
            out: channel(CapChannel::Out)?,
            cen: channel(CapChannel::Cen)?,
            inner: channel(CapChannel::In)?,
        })
    }
}

fn channel_key(side: Side, channel: CapChannel) -> String {
    format!("{}_{}", side, channel.as_str())
}

impl BaselineStore for JsonFileBaselineStore {
    fn load(&self, side: Side) -> Result<CapBaseline, EngineError> {
        let path = self.path_for(side);
        debug!("loading {} side baseline from {}", side, path.display());
        if !path.is_file() {
            return Err(EngineError::CalibrationNotFound(side));
        }
        let contents = fs::read_to_string(&path)?;
        Self::from_json(side, &contents)
    }

    fn save(&self, side: Side, baseline: &CapBaseline) -> Result<(), EngineError> {
        let path = self.path_for(side);
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, Self::to_json(side, baseline)?)?;
        info!("saved {} side baseline to {}", side, path.display());
        Ok(())
    }
}

/// Process-local baseline store
#[derive(Debug, Default)]
pub struct MemoryBaselineStore {
    baselines: Mutex<HashMap<Side, CapBaseline>>,
}

impl MemoryBaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(side: Side, baseline: CapBaseline) -> Self {
        let store = Self::default();
        if let Ok(mut map) = store.baselines.lock() {
            map.insert(side, baseline);
        }
        store
    }
}

impl BaselineStore for MemoryBaselineStore {
    fn load(&self, side: Side) -> Result<CapBaseline, EngineError> {
        let map = self
            .baselines
            .lock()
            .map_err(|e| EngineError::Task(e.to_string()))?;
        map.get(&side)
            .copied()
            .ok_or(EngineError::CalibrationNotFound(side))
    }

    fn save(&self, side: Side, baseline: &CapBaseline) -> Result<(), EngineError> {
        let mut map = self
            .baselines
            .lock()
            .map_err(|e| EngineError::Task(e.to_string()))?;
        map.insert(side, *baseline);
        Ok(())
    }
}
