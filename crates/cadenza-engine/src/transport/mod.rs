//! Playhead, loop and punch ranges, tempo, and the play/record state
//! machine.
//!
//! [`TransportSettings`] is the persisted part and lives in the project.
//! [`TransportShared`] holds the same values as atomics, plus the tempo map
//! as a published snapshot, so the audio thread can advance the playhead
//! without locks; [`Transport`] is the control side handle that drives state
//! transitions.

pub mod tempo;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use atomic_float::AtomicF64;
use cadenza_graph::TransportView;
use cadenza_rt::SnapshotCell;
use serde::{Deserialize, Serialize};

pub use tempo::{
    validate_bpm, MusicalPosition, SignatureEvent, TempoCurve, TempoEvent, TempoMap, TimeSignature, PPQ,
};

use crate::error::TransportError;

/// Upper bound on the number of loop-split ranges rendered per cycle.
pub const MAX_SEGMENTS: usize = 8;

const NO_LOCATE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransportState {
    Stopped = 0,
    Rolling = 1,
    Recording = 2,
    Paused = 3,
}

impl TransportState {
    pub fn can_transition(self, to: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, to),
            (Stopped, Rolling)
                | (Rolling, Stopped)
                | (Rolling, Paused)
                | (Rolling, Recording)
                | (Recording, Rolling)
                | (Recording, Stopped)
                | (Paused, Rolling)
                | (Paused, Stopped)
        )
    }

    /// Whether the playhead advances.
    pub fn is_rolling(self) -> bool {
        matches!(self, TransportState::Rolling | TransportState::Recording)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Rolling,
            2 => TransportState::Recording,
            3 => TransportState::Paused,
            _ => TransportState::Stopped,
        }
    }
}

/// Persisted transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    pub tempo: TempoMap,
    pub loop_start: u64,
    pub loop_end: u64,
    pub loop_enabled: bool,
    pub punch_start: u64,
    pub punch_end: u64,
    pub punch_enabled: bool,
    pub preroll_bars: u32,
    #[serde(default)]
    pub playhead: u64,
}

impl TransportSettings {
    /// Loop over the first four bars, punch over bars three and four.
    pub fn new(sample_rate: u32) -> Self {
        let tempo = TempoMap::default();
        Self {
            loop_start: 0,
            loop_end: tempo.bars_to_samples(4, sample_rate),
            loop_enabled: false,
            punch_start: tempo.bars_to_samples(2, sample_rate),
            punch_end: tempo.bars_to_samples(4, sample_rate),
            tempo,
            punch_enabled: false,
            preroll_bars: 0,
            playhead: 0,
        }
    }

    pub fn bars_to_samples(&self, bars: u32, sample_rate: u32) -> u64 {
        self.tempo.bars_to_samples(bars, sample_rate)
    }

    pub fn to_musical(&self, position: u64, sample_rate: u32) -> MusicalPosition {
        self.tempo.to_musical(position, sample_rate)
    }

    pub fn to_samples(&self, position: MusicalPosition, sample_rate: u32) -> u64 {
        self.tempo.to_samples(position, sample_rate)
    }

    pub fn set_loop_range(&mut self, start: u64, end: u64) -> Result<(), TransportError> {
        check_range(start, end)?;
        self.loop_start = start;
        self.loop_end = end;
        Ok(())
    }

    pub fn set_punch_range(&mut self, start: u64, end: u64) -> Result<(), TransportError> {
        check_range(start, end)?;
        self.punch_start = start;
        self.punch_end = end;
        Ok(())
    }
}

fn check_range(start: u64, end: u64) -> Result<(), TransportError> {
    if end <= start {
        Err(TransportError::EmptyRange { start, end })
    } else {
        Ok(())
    }
}

/// One contiguous range of a cycle. A block that straddles the loop end is
/// rendered as two or more segments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// Offset of the first frame inside the block buffers.
    pub offset: usize,
    pub frames: usize,
    /// Timeline position of the first frame.
    pub playhead: u64,
    /// Tempo at `playhead`.
    pub bpm: f64,
}

/// What the audio thread renders in one cycle. Frames past the last segment
/// are left silent; that only happens when a loop is much shorter than the
/// block.
#[derive(Debug, Clone)]
pub struct CyclePlan {
    pub state: TransportState,
    pub segments: ArrayVec<Segment, MAX_SEGMENTS>,
    /// Playhead after the cycle.
    pub end: u64,
    /// Loop wraps since recording began, counted through the end of this
    /// cycle.
    pub loop_pass: u64,
    /// Wraps after the end of the last segment, including any inside an
    /// unrendered tail.
    pub trailing_wraps: u64,
}

impl CyclePlan {
    pub fn view(&self, segment: &Segment) -> TransportView {
        TransportView {
            rolling: self.state.is_rolling(),
            recording: self.state == TransportState::Recording,
            playhead: segment.playhead,
            bpm: segment.bpm,
        }
    }
}

/// Transport values shared between the control and audio domains.
#[derive(Debug)]
pub struct TransportShared {
    state: AtomicU8,
    playhead: AtomicU64,
    locate: AtomicU64,
    loop_start: AtomicU64,
    loop_end: AtomicU64,
    loop_enabled: AtomicBool,
    punch_start: AtomicU64,
    punch_end: AtomicU64,
    punch_enabled: AtomicBool,
    capture_from: AtomicU64,
    loop_pass: AtomicU64,
    tempo: SnapshotCell<TempoMap>,
    sample_rate: AtomicU32,
    /// Tempo at the playhead after the last cycle.
    bpm: AtomicF64,
    frames_rolled: AtomicU64,
}

impl TransportShared {
    pub fn new(settings: &TransportSettings, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        let shared = Self {
            state: AtomicU8::new(TransportState::Stopped as u8),
            playhead: AtomicU64::new(settings.playhead),
            locate: AtomicU64::new(NO_LOCATE),
            loop_start: AtomicU64::new(0),
            loop_end: AtomicU64::new(0),
            loop_enabled: AtomicBool::new(false),
            punch_start: AtomicU64::new(0),
            punch_end: AtomicU64::new(0),
            punch_enabled: AtomicBool::new(false),
            capture_from: AtomicU64::new(0),
            loop_pass: AtomicU64::new(0),
            tempo: SnapshotCell::new(settings.tempo.clone()),
            sample_rate: AtomicU32::new(sample_rate),
            bpm: AtomicF64::new(settings.tempo.bpm_at(settings.playhead, sample_rate)),
            frames_rolled: AtomicU64::new(0),
        };
        shared.apply(settings);
        shared
    }

    /// Copies ranges and the tempo map from the project. State and playhead
    /// are left alone.
    pub fn apply(&self, settings: &TransportSettings) {
        self.loop_start.store(settings.loop_start, Ordering::Relaxed);
        self.loop_end.store(settings.loop_end, Ordering::Relaxed);
        self.loop_enabled.store(settings.loop_enabled, Ordering::Relaxed);
        self.punch_start.store(settings.punch_start, Ordering::Relaxed);
        self.punch_end.store(settings.punch_end, Ordering::Relaxed);
        self.punch_enabled.store(settings.punch_enabled, Ordering::Relaxed);
        if **self.tempo.load() != settings.tempo {
            self.tempo.publish(Arc::new(settings.tempo.clone()));
        }
    }

    pub fn tempo(&self) -> Arc<TempoMap> {
        self.tempo.load_full()
    }

    pub fn bpm(&self) -> f64 {
        self.bpm.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current playhead, including a locate the audio thread has not picked
    /// up yet.
    pub fn playhead(&self) -> u64 {
        match self.locate.load(Ordering::Acquire) {
            NO_LOCATE => self.playhead.load(Ordering::Acquire),
            pending => pending,
        }
    }

    pub fn frames_rolled(&self) -> u64 {
        self.frames_rolled.load(Ordering::Relaxed)
    }

    pub fn loop_pass(&self) -> u64 {
        self.loop_pass.load(Ordering::Relaxed)
    }

    /// Timeline range in which input is captured while recording.
    pub fn capture_window(&self) -> (u64, u64) {
        let from = self.capture_from.load(Ordering::Relaxed);
        if self.punch_enabled.load(Ordering::Relaxed) {
            let start = self.punch_start.load(Ordering::Relaxed).max(from);
            (start, self.punch_end.load(Ordering::Relaxed))
        } else {
            (from, u64::MAX)
        }
    }

    /// Whether punch-out has been passed during the current pass.
    pub fn past_punch_out(&self) -> bool {
        self.punch_enabled.load(Ordering::Relaxed)
            && self.playhead() >= self.punch_end.load(Ordering::Relaxed)
    }

    fn transition(&self, to: TransportState) -> Result<TransportState, TransportError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = TransportState::from_u8(current);
            if !from.can_transition(to) {
                return Err(TransportError::IllegalTransition { from, to });
            }
            match self
                .state
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }

    /// Advances the playhead by `nframes` and splits the block at the loop
    /// end. Called once per cycle by the audio thread only.
    pub fn plan_cycle(&self, nframes: usize) -> CyclePlan {
        let locate = self.locate.swap(NO_LOCATE, Ordering::AcqRel);
        if locate != NO_LOCATE {
            self.playhead.store(locate, Ordering::Release);
        }
        let state = self.state();
        let start = self.playhead.load(Ordering::Acquire);
        let tempo = self.tempo.load();
        let rate = self.sample_rate.load(Ordering::Relaxed);
        let mut segments: ArrayVec<Segment, MAX_SEGMENTS> = ArrayVec::new();
        if !state.is_rolling() || nframes == 0 {
            let bpm = tempo.bpm_at(start, rate);
            self.bpm.store(bpm, Ordering::Relaxed);
            segments.push(Segment {
                offset: 0,
                frames: nframes,
                playhead: start,
                bpm,
            });
            return CyclePlan {
                state,
                segments,
                end: start,
                loop_pass: self.loop_pass(),
                trailing_wraps: 0,
            };
        }

        let loop_start = self.loop_start.load(Ordering::Relaxed);
        let loop_end = self.loop_end.load(Ordering::Relaxed);
        let looping = self.loop_enabled.load(Ordering::Relaxed) && loop_end > loop_start;
        let mut position = start;
        let mut offset = 0;
        let mut wraps = 0;
        let mut trailing_wraps = 0;
        while offset < nframes {
            if looping && segments.is_full() {
                // Out of segments inside a very short loop. Time still moves
                // but the rest of the block is not rendered.
                let length = loop_end - loop_start;
                let into = position - loop_start + (nframes - offset) as u64;
                trailing_wraps += into / length;
                wraps += into / length;
                position = loop_start + into % length;
                break;
            }
            let remaining = nframes - offset;
            let frames = if looping && position < loop_end {
                remaining.min((loop_end - position) as usize)
            } else {
                remaining
            };
            segments.push(Segment {
                offset,
                frames,
                playhead: position,
                bpm: tempo.bpm_at(position, rate),
            });
            trailing_wraps = 0;
            offset += frames;
            position += frames as u64;
            if looping && position == loop_end {
                position = loop_start;
                wraps += 1;
                trailing_wraps += 1;
            }
        }

        self.playhead.store(position, Ordering::Release);
        self.bpm.store(tempo.bpm_at(position, rate), Ordering::Relaxed);
        self.frames_rolled.fetch_add(nframes as u64, Ordering::Relaxed);
        let loop_pass = self.loop_pass.fetch_add(wraps, Ordering::Relaxed) + wraps;
        CyclePlan {
            state,
            segments,
            end: position,
            loop_pass,
            trailing_wraps,
        }
    }
}

/// Control-side handle on the shared transport.
#[derive(Debug, Clone)]
pub struct Transport {
    shared: Arc<TransportShared>,
}

impl Transport {
    pub fn new(settings: &TransportSettings, sample_rate: u32) -> Self {
        Self {
            shared: Arc::new(TransportShared::new(settings, sample_rate)),
        }
    }

    pub fn shared(&self) -> &Arc<TransportShared> {
        &self.shared
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn playhead(&self) -> u64 {
        self.shared.playhead()
    }

    pub fn apply(&self, settings: &TransportSettings) {
        self.shared.apply(settings);
    }

    pub fn play(&self) -> Result<(), TransportError> {
        self.shared.transition(TransportState::Rolling)?;
        tracing::debug!(playhead = self.playhead(), "transport rolling");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), TransportError> {
        self.shared.transition(TransportState::Paused)?;
        Ok(())
    }

    /// Returns the state the transport was in.
    pub fn stop(&self) -> Result<TransportState, TransportError> {
        let from = self.shared.transition(TransportState::Stopped)?;
        tracing::debug!(playhead = self.playhead(), ?from, "transport stopped");
        Ok(from)
    }

    /// Starts recording. From Stopped the transport rolls first, backing up
    /// by `preroll` samples; capture still begins at the original playhead.
    pub fn record(&self, preroll: u64) -> Result<(), TransportError> {
        let state = self.state();
        if state == TransportState::Stopped {
            let from = self.playhead();
            self.shared.capture_from.store(from, Ordering::Relaxed);
            self.shared.loop_pass.store(0, Ordering::Relaxed);
            self.locate(from.saturating_sub(preroll));
            self.shared.transition(TransportState::Rolling)?;
        } else if state == TransportState::Rolling {
            self.shared
                .capture_from
                .store(self.playhead(), Ordering::Relaxed);
            self.shared.loop_pass.store(0, Ordering::Relaxed);
        }
        self.shared.transition(TransportState::Recording)?;
        tracing::info!(
            from = self.shared.capture_from.load(Ordering::Relaxed),
            "recording started"
        );
        Ok(())
    }

    /// Leaves recording but keeps rolling.
    pub fn end_recording(&self) -> Result<(), TransportError> {
        if self.state() != TransportState::Recording {
            return Err(TransportError::IllegalTransition {
                from: self.state(),
                to: TransportState::Rolling,
            });
        }
        self.shared.transition(TransportState::Rolling)?;
        Ok(())
    }

    /// Moves the playhead. The audio thread applies it at the next cycle.
    pub fn locate(&self, position: u64) {
        let position = position.min(NO_LOCATE - 1);
        self.shared.locate.store(position, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn looping(start: u64, end: u64) -> Transport {
        let mut settings = TransportSettings::new(48_000);
        settings.set_loop_range(start, end).unwrap();
        settings.loop_enabled = true;
        Transport::new(&settings, 48_000)
    }

    #[test]
    fn defaults_are_four_bar_loop_and_two_bar_punch() {
        let settings = TransportSettings::new(48_000);
        assert_eq!((settings.loop_start, settings.loop_end), (0, 384_000));
        assert_eq!((settings.punch_start, settings.punch_end), (192_000, 384_000));
    }

    #[test]
    fn illegal_transitions_are_typed_errors() {
        let transport = Transport::new(&TransportSettings::new(48_000), 48_000);
        assert_eq!(
            transport.pause(),
            Err(TransportError::IllegalTransition {
                from: TransportState::Stopped,
                to: TransportState::Paused
            })
        );
        transport.play().unwrap();
        transport.pause().unwrap();
        assert!(transport.shared.transition(TransportState::Recording).is_err());
        assert!(transport.play().is_ok());
        assert!(transport.play().is_err());
        assert_eq!(transport.stop(), Ok(TransportState::Rolling));
        assert!(transport.stop().is_err());
    }

    #[test]
    fn stopped_transport_does_not_advance() {
        let transport = Transport::new(&TransportSettings::new(48_000), 48_000);
        let plan = transport.shared.plan_cycle(256);
        assert_eq!(plan.segments.len(), 1);
        assert_eq!(transport.playhead(), 0);
    }

    #[test]
    fn block_straddling_the_loop_end_is_split() {
        let transport = looping(0, 1000);
        transport.locate(900);
        transport.play().unwrap();
        let plan = transport.shared.plan_cycle(256);
        assert_eq!(
            plan.segments.as_slice(),
            &[
                Segment {
                    offset: 0,
                    frames: 100,
                    playhead: 900,
                    bpm: 120.0
                },
                Segment {
                    offset: 100,
                    frames: 156,
                    playhead: 0,
                    bpm: 120.0
                }
            ]
        );
        assert_eq!(plan.end, 156);
        assert_eq!(plan.loop_pass, 1);
        assert_eq!(plan.trailing_wraps, 0);
    }

    #[test]
    fn playhead_past_loop_end_does_not_wrap() {
        let transport = looping(0, 1000);
        transport.locate(2000);
        transport.play().unwrap();
        let plan = transport.shared.plan_cycle(128);
        assert_eq!(plan.segments.len(), 1);
        assert_eq!(transport.playhead(), 2128);
    }

    #[test]
    fn loops_shorter_than_a_block_keep_the_playhead_in_range() {
        let transport = looping(100, 110);
        transport.locate(100);
        transport.play().unwrap();
        let plan = transport.shared.plan_cycle(512);
        assert_eq!(plan.segments.len(), MAX_SEGMENTS);
        // No segment reads past the loop end.
        assert!(plan
            .segments
            .iter()
            .all(|s| s.playhead >= 100 && s.playhead + s.frames as u64 <= 110));
        let total: usize = plan.segments.iter().map(|s| s.frames).sum();
        assert_eq!(total, MAX_SEGMENTS * 10);
        assert_eq!(plan.end, 100 + 512 % 10);
        assert_eq!(plan.loop_pass, 51);
        assert_eq!(plan.trailing_wraps, 44);
        assert_eq!(transport.shared.frames_rolled(), 512);
    }

    #[test]
    fn segments_carry_the_tempo_at_their_playhead() {
        let mut settings = TransportSettings::new(48_000);
        let transport = Transport::new(&settings, 48_000);
        // Half tempo from bar two, which starts at 96 000 samples.
        settings
            .tempo
            .set_tempo(TempoEvent::constant(4 * u64::from(PPQ), 60.0))
            .unwrap();
        settings.set_loop_range(48_000, 100_000).unwrap();
        settings.loop_enabled = true;
        transport.apply(&settings);

        transport.locate(99_900);
        transport.play().unwrap();
        let plan = transport.shared.plan_cycle(256);
        let tempi: Vec<(u64, f64)> = plan.segments.iter().map(|s| (s.playhead, s.bpm)).collect();
        assert_eq!(tempi, vec![(99_900, 60.0), (48_000, 120.0)]);
        assert_eq!(plan.view(&plan.segments[0]).bpm, 60.0);
        assert_eq!(transport.shared.bpm(), 120.0);
        assert_eq!(*transport.shared.tempo(), settings.tempo);
    }

    #[test]
    fn preroll_counts_bars_back_from_the_playhead() {
        let mut settings = TransportSettings::new(48_000);
        settings
            .tempo
            .set_signature(4 * u64::from(PPQ), TimeSignature::new(3, 4).unwrap())
            .unwrap();
        // Bar three starts after one 4/4 bar and one 3/4 bar.
        let bar_three = settings.bars_to_samples(2, 48_000);
        assert_eq!(bar_three, 96_000 + 72_000);
        assert_eq!(settings.tempo.samples_before(bar_three + 10, 1, 48_000), 72_000);
        assert_eq!(settings.to_musical(bar_three, 48_000), MusicalPosition::bar(3));
    }

    #[test]
    fn record_from_stop_applies_preroll() {
        let transport = Transport::new(&TransportSettings::new(48_000), 48_000);
        transport.locate(10_000);
        transport.record(4_000).unwrap();
        assert_eq!(transport.state(), TransportState::Recording);
        assert_eq!(transport.playhead(), 6_000);
        assert_eq!(transport.shared.capture_window(), (10_000, u64::MAX));
        transport.end_recording().unwrap();
        assert_eq!(transport.state(), TransportState::Rolling);
    }

    #[test]
    fn punch_narrows_the_capture_window() {
        let mut settings = TransportSettings::new(48_000);
        settings.punch_enabled = true;
        settings.set_punch_range(500, 900).unwrap();
        let transport = Transport::new(&settings, 48_000);
        transport.record(0).unwrap();
        assert_eq!(transport.shared.capture_window(), (500, 900));
        assert!(settings.set_punch_range(10, 10).is_err());
    }
}
