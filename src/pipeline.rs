//! Pipeline orchestration
//!
//! Two ways to drive the engine:
//! - [`LivePipeline`] streams frames from a [`FrameSource`] through both
//!   sides' vitals trackers and presence classifiers. Vitals are written as
//!   they are emitted; a sleep session is written once the bed has been empty
//!   for longer than the merge gap, and whatever is open is flushed when the
//!   run ends.
//! - [`analyze_sleep`] and [`calibrate`] process a recorded range of frames
//!   for one side in a single synchronous pass.

use std::collections::BTreeMap;
use std::future::pending;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::baseline::{calibration_samples, BaselineCalibrator};
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::presence::{merge_frames, trim_by_percentile, PresenceFusion};
use crate::sleep::SleepSessionBuilder;
use crate::source::{is_stale, FrameSource, SourcePoll};
use crate::tracker::VitalsTracker;
use crate::types::{
    CapBaseline, CapChannels, OccupancySample, PresenceSample, SensorFrame, Side, SleepRecord,
};

/// Unpaired piezo or capacitance seconds older than this are discarded
const PAIRING_HORIZON_SECONDS: i64 = 5;

/// Build sleep records for one side from a recorded range of frames.
///
/// Pipeline stages:
/// 1. Join piezo and capacitance frames per second
/// 2. Drop seconds whose piezo mean is outside the trim percentiles
/// 3. Classify occupancy against the stored capacitance baseline
/// 4. Segment the occupancy series into sleep sessions
/// 5. Write the sessions to the sleep sink
///
/// # Errors
/// [`EngineError::CalibrationNotFound`] if `side` has no stored baseline.
pub fn analyze_sleep(
    context: &EngineContext,
    side: Side,
    frames: &[SensorFrame],
) -> Result<Vec<SleepRecord>, EngineError> {
    let baseline = context.baselines.load(side)?;
    let config = &context.config;

    let merged = merge_frames(side, frames);
    let samples = trim_by_percentile(&merged, config.presence.trim_percentiles);
    info!(
        "{} side: analysing {} of {} merged seconds",
        side,
        samples.len(),
        merged.len()
    );

    let fusion = PresenceFusion::new(side, &config.presence, baseline);
    let occupancy: Vec<OccupancySample> = fusion
        .classify_series(&samples)
        .iter()
        .map(|state| state.to_occupancy())
        .collect();

    let records = SleepSessionBuilder::new(config.sleep.clone()).build(side, &occupancy);
    let written = context.sleep.insert_many(&records)?;
    info!("{} side: {} sleep records ({} new)", side, records.len(), written);
    Ok(records)
}

/// Find and store an empty-bed capacitance baseline for one side.
///
/// Pipeline stages:
/// 1. Join piezo and capacitance frames per second
/// 2. Drop seconds whose piezo mean is outside the trim percentiles
/// 3. Attach the centred piezo range to each second
/// 4. Take the first quiet window as the baseline
/// 5. Save it to the baseline store
pub fn calibrate(
    context: &EngineContext,
    side: Side,
    frames: &[SensorFrame],
) -> Result<CapBaseline, EngineError> {
    let config = &context.config;
    let merged = merge_frames(side, frames);
    let samples = trim_by_percentile(&merged, config.presence.trim_percentiles);
    let rows = calibration_samples(&samples, config.presence.range_window);

    let baseline = BaselineCalibrator::new(&config.calibration).find(side, &rows)?;
    context.baselines.save(side, &baseline)?;
    Ok(baseline)
}

/// Counters reported when a live run ends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveSummary {
    /// Frames read from the source
    pub frames_received: u64,
    /// Frames dropped for being too old
    pub frames_stale: u64,
    /// Frames handled by the consumer
    pub frames_processed: u64,
    pub vitals_written: u64,
    pub sleep_records_written: u64,
}

#[derive(Debug, Default)]
struct ProducerStats {
    received: u64,
    stale: u64,
}

/// Per-side consumer state
struct SideState {
    side: Side,
    tracker: VitalsTracker,
    fusion: PresenceFusion,
    piezo_means: BTreeMap<i64, f64>,
    caps: BTreeMap<i64, CapChannels>,
    /// Occupancy since the last closed session
    occupancy: Vec<OccupancySample>,
}

impl SideState {
    fn new(side: Side, config: &EngineConfig, baseline: CapBaseline) -> Result<Self, EngineError> {
        Ok(Self {
            side,
            tracker: VitalsTracker::new(side, config)?,
            fusion: PresenceFusion::new(side, &config.presence, baseline),
            piezo_means: BTreeMap::new(),
            caps: BTreeMap::new(),
            occupancy: Vec::new(),
        })
    }

    /// Feed any second that now has both modalities to the classifier
    fn pair(&mut self, ts: i64) {
        if let (Some(&piezo_mean), Some(&cap)) = (self.piezo_means.get(&ts), self.caps.get(&ts)) {
            self.piezo_means.remove(&ts);
            self.caps.remove(&ts);
            let state = self.fusion.push(&PresenceSample {
                ts,
                piezo_mean,
                cap,
            });
            self.occupancy.push(state.to_occupancy());
        }

        let horizon = ts - PAIRING_HORIZON_SECONDS;
        self.piezo_means.retain(|&t, _| t >= horizon);
        self.caps.retain(|&t, _| t >= horizon);
    }

    /// Split off the occupancy of sessions that can no longer grow.
    ///
    /// A session is closed once the absence after its last occupied second
    /// exceeds `max_gap_seconds`. The returned series ends at the first absent
    /// sample, which is where segmenting the whole run would end the session
    /// too. Without any occupied second only the newest sample is retained.
    fn take_closed(&mut self, max_gap_seconds: i64) -> Option<Vec<OccupancySample>> {
        let last_ts = self.occupancy.last()?.ts;
        let Some(last_occupied) = self.occupancy.iter().rposition(|s| s.occupied()) else {
            let older = self.occupancy.len() - 1;
            self.occupancy.drain(..older);
            return None;
        };

        let closed_at = self.occupancy.get(last_occupied + 1)?.ts;
        if last_ts - closed_at <= max_gap_seconds {
            return None;
        }
        let mut closed: Vec<OccupancySample> = self.occupancy.drain(..=last_occupied).collect();
        closed.extend(self.occupancy.first().copied());
        Some(closed)
    }
}

/// Streaming producer/consumer pipeline over both bed sides
#[derive(Debug, Clone)]
pub struct LivePipeline {
    context: EngineContext,
}

impl LivePipeline {
    pub fn new(context: EngineContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Run until the source is exhausted or `stop` turns true.
    ///
    /// Both sides' baselines are loaded before any frame is read; a missing
    /// baseline fails the run with [`EngineError::CalibrationNotFound`].
    pub async fn run<S>(&self, source: S, stop: watch::Receiver<bool>) -> Result<LiveSummary, EngineError>
    where
        S: FrameSource + 'static,
    {
        let mut sides = Vec::with_capacity(Side::ALL.len());
        for side in Side::ALL {
            let baseline = self.context.baselines.load(side)?;
            sides.push(SideState::new(side, &self.context.config, baseline)?);
        }
        info!("live pipeline started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let producer = tokio::spawn(Self::produce(
            source,
            tx,
            stop.clone(),
            self.context.config.live.stale_after_seconds,
            Duration::from_millis(self.context.config.live.poll_interval_ms),
        ));

        let mut summary = LiveSummary::default();
        let mut consumer_stop = stop;
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut consumer_stop) => {
                    info!("stop requested, consumer exiting");
                    break;
                }
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        summary.frames_processed += 1;
                        self.consume(&mut sides, frame, &mut summary);
                    }
                    None => break,
                },
            }
        }
        drop(rx);

        let stats = producer
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
        summary.frames_received = stats.received;
        summary.frames_stale = stats.stale;

        for state in &sides {
            summary.sleep_records_written += self.store_sessions(state.side, &state.occupancy);
        }

        info!(
            "live pipeline finished: {} frames processed, {} stale, {} vitals, {} sleep records",
            summary.frames_processed,
            summary.frames_stale,
            summary.vitals_written,
            summary.sleep_records_written
        );
        Ok(summary)
    }

    async fn produce<S: FrameSource>(
        mut source: S,
        tx: mpsc::UnboundedSender<SensorFrame>,
        mut stop: watch::Receiver<bool>,
        stale_after: i64,
        poll_interval: Duration,
    ) -> Result<ProducerStats, EngineError> {
        let mut stats = ProducerStats::default();
        loop {
            if *stop.borrow() {
                break;
            }
            match source.next_frame()? {
                SourcePoll::Frame(frame) => {
                    stats.received += 1;
                    let now = Utc::now().timestamp();
                    if is_stale(frame.ts(), now, stale_after) {
                        stats.stale += 1;
                        warn!("dropping stale frame from {} ({} s old)", frame.ts(), now - frame.ts());
                        continue;
                    }
                    if tx.send(frame).is_err() {
                        debug!("consumer gone, producer exiting");
                        break;
                    }
                }
                SourcePoll::WouldBlock => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = stopped(&mut stop) => break,
                    }
                }
                SourcePoll::Exhausted => {
                    debug!("frame source exhausted");
                    break;
                }
            }
        }
        Ok(stats)
    }

    /// Process one frame, adding what it wrote to `summary`
    fn consume(&self, sides: &mut [SideState], frame: SensorFrame, summary: &mut LiveSummary) {
        match frame {
            SensorFrame::Piezo(piezo) => {
                let ts = piezo.ts;
                let means: Vec<Option<f64>> = sides.iter().map(|s| piezo.primary_mean(s.side)).collect();
                let (left, right) = piezo.into_sides();

                for (state, (samples, mean)) in sides.iter_mut().zip([left, right].into_iter().zip(means)) {
                    if let Some(record) = state.tracker.ingest(samples) {
                        match self.context.vitals.insert(&record) {
                            Ok(true) => summary.vitals_written += 1,
                            Ok(false) => debug!("{} vitals @ {} already stored", state.side, ts),
                            Err(err) => error!("{} side: failed to store vitals: {}", state.side, err),
                        }
                    }
                    if let Some(mean) = mean {
                        state.piezo_means.insert(ts, mean);
                        state.pair(ts);
                    }
                }
            }
            SensorFrame::Cap(cap) => {
                for state in sides.iter_mut() {
                    state.caps.insert(cap.ts, cap.side(state.side).channels);
                    state.pair(cap.ts);
                }
            }
        }

        let max_gap = self.context.config.sleep.max_gap_seconds;
        for state in sides.iter_mut() {
            if let Some(closed) = state.take_closed(max_gap) {
                summary.sleep_records_written += self.store_sessions(state.side, &closed);
            }
        }
    }

    /// Segment `occupancy` and write the sessions; returns the number stored
    fn store_sessions(&self, side: Side, occupancy: &[OccupancySample]) -> u64 {
        let records = SleepSessionBuilder::new(self.context.config.sleep.clone()).build(side, occupancy);
        if records.is_empty() {
            return 0;
        }
        match self.context.sleep.insert_many(&records) {
            Ok(written) => written as u64,
            Err(err) => {
                error!("{} side: failed to store sleep records: {}", side, err);
                0
            }
        }
    }
}

/// Resolves once `stop` reads true; never resolves if the sender is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}
