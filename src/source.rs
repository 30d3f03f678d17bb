//! Pull-based sensor frame sources
//!
//! A [`FrameSource`] yields decoded frames one at a time. A source that has
//! nothing new right now returns [`SourcePoll::WouldBlock`]; the live
//! producer backs off and polls again. [`SourcePoll::Exhausted`] ends a run.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::EngineError;
use crate::types::SensorFrame;

/// Result of polling a source
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    Frame(SensorFrame),
    WouldBlock,
    Exhausted,
}

pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<SourcePoll, EngineError>;
}

/// Whether a frame stamped `frame_ts` is older than `stale_after` at `now_ts`
pub fn is_stale(frame_ts: i64, now_ts: i64, stale_after: i64) -> bool {
    now_ts - frame_ts > stale_after
}

/// Drain a source into memory. A would-block poll ends the drain.
pub fn read_all(source: &mut dyn FrameSource) -> Result<Vec<SensorFrame>, EngineError> {
    let mut frames = Vec::new();
    loop {
        match source.next_frame()? {
            SourcePoll::Frame(frame) => frames.push(frame),
            SourcePoll::WouldBlock | SourcePoll::Exhausted => break,
        }
    }
    debug!("read {} frames", frames.len());
    Ok(frames)
}

/// Drain the frames of `source` stamped within `[start, end]`.
///
/// # Errors
/// [`EngineError::InvalidRange`] when `start >= end`, and
/// [`EngineError::SourceExhausted`] when the source ends without a frame in
/// range.
pub fn read_range<S: FrameSource>(source: S, start: i64, end: i64) -> Result<Vec<SensorFrame>, EngineError> {
    let mut bounded = BoundedSource::new(source, start, end)?;
    let frames = read_all(&mut bounded)?;
    if frames.is_empty() {
        return Err(EngineError::SourceExhausted);
    }
    Ok(frames)
}

/// Frames held in memory
#[derive(Debug, Clone, Default)]
pub struct VecFrameSource {
    frames: VecDeque<SensorFrame>,
}

impl VecFrameSource {
    pub fn new(frames: impl IntoIterator<Item = SensorFrame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for VecFrameSource {
    fn next_frame(&mut self) -> Result<SourcePoll, EngineError> {
        Ok(match self.frames.pop_front() {
            Some(frame) => SourcePoll::Frame(frame),
            None => SourcePoll::Exhausted,
        })
    }
}

/// Newline-delimited JSON sensor log.
///
/// Records of other types and malformed lines are skipped. In follow mode the
/// end of file means "nothing yet" and a partially written last line is held
/// back until its newline arrives.
#[derive(Debug)]
pub struct NdjsonFrameSource {
    path: PathBuf,
    reader: BufReader<File>,
    follow: bool,
    pending: String,
    line_number: usize,
    skipped: usize,
}

impl NdjsonFrameSource {
    pub fn open(path: impl AsRef<Path>, follow: bool) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            follow,
            pending: String::new(),
            line_number: 0,
            skipped: 0,
        })
    }

    /// Lines that did not decode to a sensor frame
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode(&mut self, line: &str) -> Option<SensorFrame> {
        self.line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<SensorFrame>(line) {
            Ok(frame) => Some(frame),
            Err(err) => {
                self.skipped += 1;
                debug!("{}:{}: skipped: {}", self.path.display(), self.line_number, err);
                None
            }
        }
    }
}

impl FrameSource for NdjsonFrameSource {
    fn next_frame(&mut self) -> Result<SourcePoll, EngineError> {
        loop {
            let read = self.reader.read_line(&mut self.pending)?;
            if read == 0 {
                if self.follow {
                    return Ok(SourcePoll::WouldBlock);
                }
                if !self.pending.is_empty() {
                    let line = std::mem::take(&mut self.pending);
                    if let Some(frame) = self.decode(&line) {
                        return Ok(SourcePoll::Frame(frame));
                    }
                }
                if self.skipped > 0 {
                    warn!("{}: skipped {} unreadable lines", self.path.display(), self.skipped);
                }
                return Ok(SourcePoll::Exhausted);
            }
            if !self.pending.ends_with('\n') {
                // partial line; wait for the writer in follow mode
                if self.follow {
                    return Ok(SourcePoll::WouldBlock);
                }
                continue;
            }

            let line = std::mem::take(&mut self.pending);
            if let Some(frame) = self.decode(&line) {
                return Ok(SourcePoll::Frame(frame));
            }
        }
    }
}

/// Frames of `inner` whose timestamp lies in `[start, end]`
#[derive(Debug)]
pub struct BoundedSource<S> {
    inner: S,
    start: i64,
    end: i64,
}

impl<S: FrameSource> BoundedSource<S> {
    pub fn new(inner: S, start: i64, end: i64) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidRange(format!(
                "start {} must be earlier than end {}",
                start, end
            )));
        }
        Ok(Self { inner, start, end })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: FrameSource> FrameSource for BoundedSource<S> {
    fn next_frame(&mut self) -> Result<SourcePoll, EngineError> {
        loop {
            match self.inner.next_frame()? {
                SourcePoll::Frame(frame) if (self.start..=self.end).contains(&frame.ts()) => {
                    return Ok(SourcePoll::Frame(frame));
                }
                SourcePoll::Frame(_) => continue,
                other => return Ok(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapChannels, CapFrame, CapReading};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn make_cap_frame(ts: i64) -> SensorFrame {
        let reading = CapReading {
            channels: CapChannels {
                out: 1.0,
                cen: 2.0,
                inner: 3.0,
            },
            status: None,
        };
        SensorFrame::Cap(CapFrame {
            ts,
            left: reading.clone(),
            right: reading,
            seq: ts as u64,
        })
    }

    fn frame_ts(poll: SourcePoll) -> Option<i64> {
        match poll {
            SourcePoll::Frame(frame) => Some(frame.ts()),
            _ => None,
        }
    }

    #[test]
    fn test_staleness() {
        assert!(!is_stale(1_000, 1_120, 120));
        assert!(is_stale(1_000, 1_121, 120));
    }

    #[test]
    fn test_vec_source() {
        let mut source = VecFrameSource::new(vec![make_cap_frame(1), make_cap_frame(2)]);
        assert_eq!(frame_ts(source.next_frame().unwrap()), Some(1));
        assert_eq!(frame_ts(source.next_frame().unwrap()), Some(2));
        assert_eq!(source.next_frame().unwrap(), SourcePoll::Exhausted);
    }

    #[test]
    fn test_bounded_source() {
        let inner = VecFrameSource::new((0..10).map(make_cap_frame));
        let mut source = BoundedSource::new(inner, 3, 5).unwrap();
        let frames = read_all(&mut source).unwrap();
        let stamps: Vec<i64> = frames.iter().map(|f| f.ts()).collect();
        assert_eq!(stamps, vec![3, 4, 5]);

        assert!(BoundedSource::new(VecFrameSource::default(), 5, 5).is_err());
    }

    #[test]
    fn test_read_range() {
        let frames = read_range(VecFrameSource::new((0..10).map(make_cap_frame)), 8, 20).unwrap();
        assert_eq!(frames, vec![make_cap_frame(8), make_cap_frame(9)]);

        let empty = read_range(VecFrameSource::new((0..10).map(make_cap_frame)), 20, 30);
        assert!(matches!(empty, Err(EngineError::SourceExhausted)));
        let inverted = read_range(VecFrameSource::default(), 30, 20);
        assert!(matches!(inverted, Err(EngineError::InvalidRange(_))));
    }

    #[test]
    fn test_ndjson_source_skips_foreign_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", serde_json::to_string(&make_cap_frame(1)).unwrap()).unwrap();
        writeln!(file, r#"{{"type":"bedTemp","ts":2}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        write!(file, "{}", serde_json::to_string(&make_cap_frame(3)).unwrap()).unwrap();
        file.flush().unwrap();

        let mut source = NdjsonFrameSource::open(file.path(), false).unwrap();
        let frames = read_all(&mut source).unwrap();
        assert_eq!(frames, vec![make_cap_frame(1), make_cap_frame(3)]);
        assert_eq!(source.skipped(), 2);
    }

    #[test]
    fn test_ndjson_follow_waits_for_complete_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let line = serde_json::to_string(&make_cap_frame(7)).unwrap();
        let (head, tail) = line.split_at(10);
        write!(file, "{}", head).unwrap();
        file.flush().unwrap();

        let mut source = NdjsonFrameSource::open(file.path(), true).unwrap();
        assert_eq!(source.next_frame().unwrap(), SourcePoll::WouldBlock);

        writeln!(file, "{}", tail).unwrap();
        file.flush().unwrap();
        assert_eq!(frame_ts(source.next_frame().unwrap()), Some(7));
        assert_eq!(source.next_frame().unwrap(), SourcePoll::WouldBlock);
    }
}
