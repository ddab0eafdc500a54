//! Tempo track and meter.
//!
//! Musical time is counted in ticks, [`PPQ`] per quarter note, from the
//! start of the timeline. Tempo events change the rate at which ticks pass
//! and may ramp linearly to the next event; signature events regroup ticks
//! into bars and beats and always fall on a bar line.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Ticks per quarter note.
pub const PPQ: u32 = 960;

/// Below this bpm difference a ramp is timed as constant.
const RAMP_EPSILON: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u8,
    pub denominator: u8,
}

impl TimeSignature {
    pub fn new(numerator: u8, denominator: u8) -> Result<Self, TransportError> {
        let valid = (1..=32).contains(&numerator) && matches!(denominator, 1 | 2 | 4 | 8 | 16 | 32);
        if valid {
            Ok(Self {
                numerator,
                denominator,
            })
        } else {
            Err(TransportError::InvalidTimeSignature {
                numerator,
                denominator,
            })
        }
    }

    /// Ticks in one denominator note.
    pub fn ticks_per_beat(self) -> u64 {
        u64::from(PPQ) * 4 / u64::from(self.denominator)
    }

    pub fn ticks_per_bar(self) -> u64 {
        self.ticks_per_beat() * u64::from(self.numerator)
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

/// Bar, beat (both 1-based) and tick within the beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MusicalPosition {
    pub bar: u32,
    pub beat: u32,
    pub tick: u32,
}

impl MusicalPosition {
    pub fn bar(bar: u32) -> Self {
        Self {
            bar,
            beat: 1,
            tick: 0,
        }
    }
}

impl fmt::Display for MusicalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{:03}", self.bar, self.beat, self.tick)
    }
}

pub fn validate_bpm(bpm: f64) -> Result<f64, TransportError> {
    if bpm.is_finite() && (1.0..=999.0).contains(&bpm) {
        Ok(bpm)
    } else {
        Err(TransportError::InvalidTempo(bpm))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempoCurve {
    /// Holds until the next event.
    #[default]
    Constant,
    /// Ramps linearly to the next event's bpm. The last event holds.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoEvent {
    pub tick: u64,
    pub bpm: f64,
    #[serde(default)]
    pub curve: TempoCurve,
}

impl TempoEvent {
    pub fn constant(tick: u64, bpm: f64) -> Self {
        Self {
            tick,
            bpm,
            curve: TempoCurve::Constant,
        }
    }

    pub fn linear(tick: u64, bpm: f64) -> Self {
        Self {
            tick,
            bpm,
            curve: TempoCurve::Linear,
        }
    }

    /// Slope in bpm per quarter note towards `next`, when this event ramps.
    fn slope(&self, next: Option<&TempoEvent>) -> Option<f64> {
        let next = next.filter(|_| self.curve == TempoCurve::Linear)?;
        let delta = next.bpm - self.bpm;
        if delta.abs() < RAMP_EPSILON {
            return None;
        }
        Some(delta / quarters(next.tick - self.tick))
    }

    /// Seconds taken by the first `ticks` ticks after this event.
    fn seconds_for(&self, next: Option<&TempoEvent>, ticks: f64) -> f64 {
        let beats = ticks / f64::from(PPQ);
        match self.slope(next) {
            Some(slope) => 60.0 / slope * ((self.bpm + slope * beats) / self.bpm).ln(),
            None => beats * 60.0 / self.bpm,
        }
    }

    fn ticks_for(&self, next: Option<&TempoEvent>, seconds: f64) -> f64 {
        let beats = match self.slope(next) {
            Some(slope) => ((seconds * slope / 60.0).exp() - 1.0) * self.bpm / slope,
            None => seconds * self.bpm / 60.0,
        };
        beats * f64::from(PPQ)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEvent {
    pub tick: u64,
    pub signature: TimeSignature,
}

fn quarters(ticks: u64) -> f64 {
    ticks as f64 / f64::from(PPQ)
}

/// Tempo and meter over the timeline.
///
/// There is always a tempo event and a signature event at tick 0; neither
/// can be removed. Adding an event at a tick that already has one replaces
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TempoMapData", into = "TempoMapData")]
pub struct TempoMap {
    tempo: Vec<TempoEvent>,
    signatures: Vec<SignatureEvent>,
    /// Seconds from tick 0 to each tempo event.
    seconds: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct TempoMapData {
    tempo: Vec<TempoEvent>,
    signatures: Vec<SignatureEvent>,
}

impl TryFrom<TempoMapData> for TempoMap {
    type Error = TransportError;

    fn try_from(mut data: TempoMapData) -> Result<Self, TransportError> {
        let mut map = TempoMap::default();
        data.signatures.sort_by_key(|event| event.tick);
        for event in data.signatures {
            map.set_signature(event.tick, event.signature)?;
        }
        for event in data.tempo {
            map.set_tempo(event)?;
        }
        Ok(map)
    }
}

impl From<TempoMap> for TempoMapData {
    fn from(map: TempoMap) -> Self {
        Self {
            tempo: map.tempo,
            signatures: map.signatures,
        }
    }
}

impl Default for TempoMap {
    /// 120 bpm in 4/4.
    fn default() -> Self {
        Self {
            tempo: vec![TempoEvent::constant(0, 120.0)],
            signatures: vec![SignatureEvent {
                tick: 0,
                signature: TimeSignature::default(),
            }],
            seconds: vec![0.0],
        }
    }
}

impl TempoMap {
    pub fn new(bpm: f64, signature: TimeSignature) -> Result<Self, TransportError> {
        let mut map = Self::default();
        map.set_tempo(TempoEvent::constant(0, bpm))?;
        map.set_signature(0, signature)?;
        Ok(map)
    }

    pub fn tempo_events(&self) -> &[TempoEvent] {
        &self.tempo
    }

    pub fn signature_events(&self) -> &[SignatureEvent] {
        &self.signatures
    }

    /// The event at tick 0.
    pub fn initial_tempo(&self) -> TempoEvent {
        self.tempo[0]
    }

    pub fn initial_signature(&self) -> TimeSignature {
        self.signatures[0].signature
    }

    /// Inserts `event`, returning the one it replaced.
    pub fn set_tempo(&mut self, event: TempoEvent) -> Result<Option<TempoEvent>, TransportError> {
        validate_bpm(event.bpm)?;
        let replaced = match self.tempo.binary_search_by_key(&event.tick, |e| e.tick) {
            Ok(index) => Some(std::mem::replace(&mut self.tempo[index], event)),
            Err(index) => {
                self.tempo.insert(index, event);
                None
            }
        };
        self.rebuild();
        Ok(replaced)
    }

    pub fn remove_tempo(&mut self, tick: u64) -> Result<TempoEvent, TransportError> {
        if tick == 0 {
            return Err(TransportError::FirstEventFixed);
        }
        let index = self
            .tempo
            .binary_search_by_key(&tick, |e| e.tick)
            .map_err(|_| TransportError::NoTempoEvent { tick })?;
        let removed = self.tempo.remove(index);
        self.rebuild();
        Ok(removed)
    }

    /// Inserts a meter change, returning the signature it replaced. Every
    /// signature event must stay on a bar line of the one before it.
    pub fn set_signature(
        &mut self,
        tick: u64,
        signature: TimeSignature,
    ) -> Result<Option<TimeSignature>, TransportError> {
        let signature = TimeSignature::new(signature.numerator, signature.denominator)?;
        let mut events = self.signatures.clone();
        let event = SignatureEvent { tick, signature };
        let replaced = match events.binary_search_by_key(&tick, |e| e.tick) {
            Ok(index) => Some(std::mem::replace(&mut events[index], event).signature),
            Err(index) => {
                events.insert(index, event);
                None
            }
        };
        check_bar_lines(&events)?;
        self.signatures = events;
        Ok(replaced)
    }

    pub fn remove_signature(&mut self, tick: u64) -> Result<TimeSignature, TransportError> {
        if tick == 0 {
            return Err(TransportError::FirstEventFixed);
        }
        let mut events = self.signatures.clone();
        let index = events
            .binary_search_by_key(&tick, |e| e.tick)
            .map_err(|_| TransportError::NoSignatureEvent { tick })?;
        let removed = events.remove(index);
        check_bar_lines(&events)?;
        self.signatures = events;
        Ok(removed.signature)
    }

    fn rebuild(&mut self) {
        self.seconds.clear();
        let mut total = 0.0;
        for (index, event) in self.tempo.iter().enumerate() {
            self.seconds.push(total);
            if let Some(next) = self.tempo.get(index + 1) {
                total += event.seconds_for(Some(next), (next.tick - event.tick) as f64);
            }
        }
    }

    fn tempo_index(&self, tick: f64) -> usize {
        self.tempo
            .partition_point(|e| e.tick as f64 <= tick)
            .saturating_sub(1)
    }

    pub fn bpm_at_tick(&self, tick: f64) -> f64 {
        let index = self.tempo_index(tick);
        let event = &self.tempo[index];
        match event.slope(self.tempo.get(index + 1)) {
            Some(slope) => event.bpm + slope * (tick - event.tick as f64) / f64::from(PPQ),
            None => event.bpm,
        }
    }

    pub fn bpm_at(&self, position: u64, sample_rate: u32) -> f64 {
        self.bpm_at_tick(self.samples_to_tick(position, sample_rate))
    }

    pub fn tick_to_seconds(&self, tick: f64) -> f64 {
        let tick = tick.max(0.0);
        let index = self.tempo_index(tick);
        let event = &self.tempo[index];
        self.seconds[index] + event.seconds_for(self.tempo.get(index + 1), tick - event.tick as f64)
    }

    pub fn seconds_to_tick(&self, seconds: f64) -> f64 {
        let seconds = seconds.max(0.0);
        let index = self.seconds.partition_point(|&t| t <= seconds).saturating_sub(1);
        let event = &self.tempo[index];
        event.tick as f64 + event.ticks_for(self.tempo.get(index + 1), seconds - self.seconds[index])
    }

    pub fn tick_to_samples(&self, tick: f64, sample_rate: u32) -> u64 {
        (self.tick_to_seconds(tick) * f64::from(sample_rate)).round() as u64
    }

    pub fn samples_to_tick(&self, position: u64, sample_rate: u32) -> f64 {
        self.seconds_to_tick(position as f64 / f64::from(sample_rate))
    }

    pub fn signature_at(&self, tick: u64) -> TimeSignature {
        self.signatures[self.signature_index(tick)].signature
    }

    fn signature_index(&self, tick: u64) -> usize {
        self.signatures
            .partition_point(|e| e.tick <= tick)
            .saturating_sub(1)
    }

    /// 1-based bar number on which signature event `index` starts.
    fn first_bar_of(&self, index: usize) -> u64 {
        1 + self
            .signatures
            .windows(2)
            .take(index)
            .map(|pair| (pair[1].tick - pair[0].tick) / pair[0].signature.ticks_per_bar())
            .sum::<u64>()
    }

    pub fn tick_to_musical(&self, tick: u64) -> MusicalPosition {
        let index = self.signature_index(tick);
        let event = self.signatures[index];
        let per_bar = event.signature.ticks_per_bar();
        let per_beat = event.signature.ticks_per_beat();
        let into = tick - event.tick;
        let in_bar = into % per_bar;
        MusicalPosition {
            bar: (self.first_bar_of(index) + into / per_bar) as u32,
            beat: (in_bar / per_beat) as u32 + 1,
            tick: (in_bar % per_beat) as u32,
        }
    }

    pub fn musical_to_tick(&self, position: MusicalPosition) -> u64 {
        let target = u64::from(position.bar.max(1));
        let mut bar = 1;
        let mut index = 0;
        for (i, pair) in self.signatures.windows(2).enumerate() {
            let bars = (pair[1].tick - pair[0].tick) / pair[0].signature.ticks_per_bar();
            if bar + bars > target {
                break;
            }
            bar += bars;
            index = i + 1;
        }
        let event = self.signatures[index];
        event.tick
            + (target - bar) * event.signature.ticks_per_bar()
            + u64::from(position.beat.saturating_sub(1)) * event.signature.ticks_per_beat()
            + u64::from(position.tick)
    }

    /// The musical position at or before the sample `position`.
    pub fn to_musical(&self, position: u64, sample_rate: u32) -> MusicalPosition {
        let tick = self.samples_to_tick(position, sample_rate).round().max(0.0) as u64;
        let tick = if tick > 0 && self.tick_to_samples(tick as f64, sample_rate) > position {
            tick - 1
        } else {
            tick
        };
        self.tick_to_musical(tick)
    }

    pub fn to_samples(&self, position: MusicalPosition, sample_rate: u32) -> u64 {
        self.tick_to_samples(self.musical_to_tick(position) as f64, sample_rate)
    }

    /// Where bar `bars + 1` starts, i.e. the length of the first `bars` bars.
    pub fn bars_to_samples(&self, bars: u32, sample_rate: u32) -> u64 {
        self.to_samples(MusicalPosition::bar(bars.saturating_add(1)), sample_rate)
    }

    /// Distance back from `position` to the same offset `bars` bars
    /// earlier, stopping at the timeline start.
    pub fn samples_before(&self, position: u64, bars: u32, sample_rate: u32) -> u64 {
        let tick = self.samples_to_tick(position, sample_rate);
        let here = self.tick_to_musical(tick.floor() as u64);
        if u64::from(here.bar) <= u64::from(bars) {
            return position;
        }
        let bar_start = self.musical_to_tick(MusicalPosition::bar(here.bar)) as f64;
        let earlier = self.musical_to_tick(MusicalPosition::bar(here.bar - bars)) as f64;
        let target = self.tick_to_samples(earlier + (tick - bar_start), sample_rate);
        position.saturating_sub(target)
    }
}

fn check_bar_lines(events: &[SignatureEvent]) -> Result<(), TransportError> {
    for pair in events.windows(2) {
        if (pair[1].tick - pair[0].tick) % pair[0].signature.ticks_per_bar() != 0 {
            return Err(TransportError::OffBarLine { tick: pair[1].tick });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUARTER: u64 = PPQ as u64;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn bars_at_the_default_tempo() {
        let map = TempoMap::default();
        assert_eq!(map.bars_to_samples(4, 48_000), 384_000);
        assert_eq!(map.bpm_at(1_000_000, 48_000), 120.0);
    }

    #[test]
    fn musical_positions_convert_both_ways() {
        let map = TempoMap::new(90.0, TimeSignature::new(3, 4).unwrap()).unwrap();
        let position = MusicalPosition {
            bar: 3,
            beat: 2,
            tick: 480,
        };
        let samples = map.to_samples(position, 44_100);
        assert_eq!(samples, 220_500);
        assert_eq!(map.to_musical(samples, 44_100), position);
        assert_eq!(map.to_musical(samples - 1, 44_100).tick, 479);
        assert_eq!(position.to_string(), "3.2.480");
    }

    #[test]
    fn eighth_note_meters_use_shorter_beats() {
        let map = TempoMap::new(120.0, TimeSignature::new(6, 8).unwrap()).unwrap();
        assert_eq!(map.to_samples(MusicalPosition { bar: 1, beat: 2, tick: 0 }, 48_000), 12_000);
        assert_eq!(map.bars_to_samples(1, 48_000), 72_000);
    }

    #[test]
    fn tempo_steps_change_the_clock_rate() {
        let mut map = TempoMap::default();
        map.set_tempo(TempoEvent::constant(2 * QUARTER, 60.0)).unwrap();
        // Two beats at 120, then two at 60.
        assert!(close(map.tick_to_seconds((4 * QUARTER) as f64), 3.0));
        assert!(close(map.seconds_to_tick(2.0), (3 * QUARTER) as f64));
        assert_eq!(map.bpm_at_tick(QUARTER as f64), 120.0);
        assert_eq!(map.bpm_at_tick((2 * QUARTER) as f64), 60.0);
    }

    #[test]
    fn linear_ramp_integrates_the_tempo() {
        let mut map = TempoMap::default();
        map.set_tempo(TempoEvent::linear(0, 120.0)).unwrap();
        map.set_tempo(TempoEvent::constant(4 * QUARTER, 240.0)).unwrap();

        assert!(close(map.bpm_at_tick((2 * QUARTER) as f64), 180.0));
        // 30 bpm per beat over four beats: 60 / 30 * ln(240 / 120).
        let ramp = 2.0 * 2f64.ln();
        assert!(close(map.tick_to_seconds((4 * QUARTER) as f64), ramp));
        assert!(close(map.tick_to_seconds((5 * QUARTER) as f64), ramp + 0.25));
        assert!(close(map.seconds_to_tick(ramp), (4 * QUARTER) as f64));
        // Faster than a constant 120 but slower than a constant 240.
        let half = map.tick_to_seconds((2 * QUARTER) as f64);
        assert!(half < 1.0 && half > 0.5);
        assert!(close(map.seconds_to_tick(half), (2 * QUARTER) as f64));
    }

    #[test]
    fn flat_ramp_is_timed_as_constant() {
        let mut map = TempoMap::default();
        map.set_tempo(TempoEvent::linear(0, 120.0)).unwrap();
        map.set_tempo(TempoEvent::constant(QUARTER, 120.0)).unwrap();
        assert!(close(map.tick_to_seconds((2 * QUARTER) as f64), 1.0));
        assert!(map.seconds_to_tick(0.75).is_finite());
    }

    #[test]
    fn events_replace_at_the_same_tick_and_the_first_stays() {
        let mut map = TempoMap::default();
        assert_eq!(map.set_tempo(TempoEvent::constant(QUARTER, 90.0)), Ok(None));
        let replaced = map.set_tempo(TempoEvent::constant(QUARTER, 100.0)).unwrap();
        assert_eq!(replaced.map(|e| e.bpm), Some(90.0));
        assert_eq!(map.tempo_events().len(), 2);
        assert_eq!(map.remove_tempo(0), Err(TransportError::FirstEventFixed));
        assert_eq!(map.remove_tempo(7), Err(TransportError::NoTempoEvent { tick: 7 }));
        assert_eq!(map.remove_tempo(QUARTER).map(|e| e.bpm), Ok(100.0));
        assert!(close(map.tick_to_seconds((2 * QUARTER) as f64), 1.0));
        assert!(map.set_tempo(TempoEvent::constant(0, 0.0)).is_err());
    }

    #[test]
    fn meter_changes_regroup_bars() {
        let mut map = TempoMap::default();
        let three_four = TimeSignature::new(3, 4).unwrap();
        let change = 2 * 4 * QUARTER;
        map.set_signature(change, three_four).unwrap();

        assert_eq!(map.tick_to_musical(change), MusicalPosition::bar(3));
        assert_eq!(map.tick_to_musical(change + 3 * QUARTER), MusicalPosition::bar(4));
        let position = MusicalPosition {
            bar: 4,
            beat: 2,
            tick: 10,
        };
        assert_eq!(map.musical_to_tick(position), change + 4 * QUARTER + 10);
        assert_eq!(map.tick_to_musical(change + 4 * QUARTER + 10), position);
        assert_eq!(map.signature_at(change - 1), TimeSignature::default());
        assert_eq!(map.signature_at(change), three_four);
    }

    #[test]
    fn meter_changes_must_land_on_bar_lines() {
        let mut map = TempoMap::default();
        assert_eq!(
            map.set_signature(1_000, TimeSignature::default()),
            Err(TransportError::OffBarLine { tick: 1_000 })
        );
        let change = 2 * 4 * QUARTER;
        map.set_signature(change, TimeSignature::new(3, 4).unwrap()).unwrap();
        // A 7/8 bar from bar two would put the 3/4 change mid-bar.
        let before = map.clone();
        assert!(map.set_signature(4 * QUARTER, TimeSignature::new(7, 8).unwrap()).is_err());
        assert!(map.set_signature(0, TimeSignature::new(3, 4).unwrap()).is_err());
        assert_eq!(map, before);
        assert_eq!(map.remove_signature(0), Err(TransportError::FirstEventFixed));
        assert_eq!(map.remove_signature(change), Ok(TimeSignature::new(3, 4).unwrap()));
    }

    #[test]
    fn preroll_measures_bars_under_the_current_tempo() {
        let mut map = TempoMap::default();
        // Bar one at 120, bar two onwards at 60.
        map.set_tempo(TempoEvent::constant(4 * QUARTER, 60.0)).unwrap();
        let bar_three = map.bars_to_samples(2, 48_000);
        assert_eq!(bar_three, 96_000 + 192_000);
        assert_eq!(map.samples_before(bar_three, 1, 48_000), 192_000);
        assert_eq!(map.samples_before(bar_three, 2, 48_000), bar_three);
        assert_eq!(map.samples_before(1_000, 4, 48_000), 1_000);
    }

    #[test]
    fn persisted_maps_are_rebuilt_and_checked() {
        let mut map = TempoMap::default();
        map.set_tempo(TempoEvent::linear(QUARTER, 100.0)).unwrap();
        map.set_tempo(TempoEvent::constant(8 * QUARTER, 140.0)).unwrap();
        map.set_signature(4 * QUARTER, TimeSignature::new(7, 8).unwrap()).unwrap();
        let json = serde_json::to_string(&map).unwrap();
        let loaded: TempoMap = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, map);

        let bad = r#"{"tempo":[{"tick":0,"bpm":120.0}],"signatures":[{"tick":100,"signature":{"numerator":4,"denominator":4}}]}"#;
        assert!(serde_json::from_str::<TempoMap>(bad).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(TimeSignature::new(4, 3).is_err());
        assert!(TimeSignature::new(0, 4).is_err());
        assert!(validate_bpm(0.5).is_err());
        assert!(validate_bpm(f64::NAN).is_err());
        assert_eq!(validate_bpm(140.0), Ok(140.0));
    }
}
