use serde::{Deserialize, Serialize};

use crate::automation::AutomationTrack;
use crate::error::ActionError;
use crate::ids::{IdAllocator, RegionId, TrackId};
use crate::model::channel::Channel;
use crate::model::region::{Region, RegionKind};
use crate::recording::RecordingMode;

/// Number of macro knobs on a modulator track.
pub const MACRO_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Midi,
    Instrument,
    Bus,
    Chord,
    Marker,
    Modulator,
    Master,
}

impl TrackKind {
    pub fn has_channel(self) -> bool {
        !matches!(self, TrackKind::Marker | TrackKind::Modulator)
    }

    /// Region type this track's lanes hold, if any.
    pub fn region_kind(self) -> Option<RegionKind> {
        match self {
            TrackKind::Audio => Some(RegionKind::Audio),
            TrackKind::Midi | TrackKind::Instrument => Some(RegionKind::Midi),
            TrackKind::Chord => Some(RegionKind::Chord),
            _ => None,
        }
    }

    /// Whether the channel carries MIDI into its plugin chain.
    pub fn is_midi_based(self) -> bool {
        matches!(self, TrackKind::Midi | TrackKind::Instrument | TrackKind::Chord)
    }

    /// Whether other channels may route into this one.
    pub fn accepts_routing(self) -> bool {
        matches!(self, TrackKind::Bus | TrackKind::Master)
    }

    pub fn can_record(self) -> bool {
        matches!(self, TrackKind::Audio | TrackKind::Midi | TrackKind::Instrument)
    }
}

/// One row of regions inside a track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    pub name: String,
    #[serde(default)]
    pub muted: bool,
    pub regions: Vec<Region>,
}

impl Lane {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            muted: false,
            regions: Vec::new(),
        }
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.iter().find(|region| region.id == id)
    }

    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.iter_mut().find(|region| region.id == id)
    }

    pub fn has_overlap(&self, start: u64, end: u64, except: Option<RegionId>) -> bool {
        self.regions
            .iter()
            .any(|region| Some(region.id) != except && region.overlaps(start, end))
    }

    /// Inserts in position order. Fails if the region overlaps another one.
    pub fn insert(&mut self, region: Region) -> Result<usize, ActionError> {
        if self.has_overlap(region.position, region.end(), None) {
            return Err(ActionError::invalid(format!(
                "{} overlaps another region of lane \"{}\"",
                region.id, self.name
            )));
        }
        Ok(self.insert_unchecked(region))
    }

    pub(crate) fn insert_unchecked(&mut self, region: Region) -> usize {
        let index = self
            .regions
            .partition_point(|existing| existing.position <= region.position);
        self.regions.insert(index, region);
        index
    }

    pub fn remove(&mut self, id: RegionId) -> Option<Region> {
        let index = self.regions.iter().position(|region| region.id == id)?;
        Some(self.regions.remove(index))
    }

    pub fn sort(&mut self) {
        self.regions.sort_by_key(|region| region.position);
    }

    /// Makes `winner` the only region over its range: regions it covers are
    /// removed, regions it overlaps are trimmed, and a region it sits inside
    /// is split around it.
    pub fn resolve_overlaps(&mut self, winner: RegionId, ids: &mut IdAllocator) {
        let Some((start, end)) = self.region(winner).map(|r| (r.position, r.end())) else {
            return;
        };
        let mut kept = Vec::with_capacity(self.regions.len() + 1);
        for mut region in self.regions.drain(..) {
            if region.id == winner || !region.overlaps(start, end) {
                kept.push(region);
                continue;
            }
            if region.position >= start && region.end() <= end {
                continue;
            }
            if region.position < start {
                let tail = if region.end() > end {
                    region.split_at(end, ids)
                } else {
                    None
                };
                region.resize(start - region.position);
                kept.push(region);
                kept.extend(tail);
            } else {
                region.trim_start(end);
                kept.push(region);
            }
        }
        self.regions = kept;
        self.sort();
    }

    pub fn is_non_overlapping(&self) -> bool {
        let mut sorted: Vec<_> = self.regions.iter().map(|r| (r.position, r.end())).collect();
        sorted.sort_unstable();
        sorted.windows(2).all(|pair| pair[0].1 <= pair[1].0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    /// `0xRRGGBB`.
    pub color: u32,
    pub kind: TrackKind,
    pub lanes: Vec<Lane>,
    pub channel: Option<Channel>,
    #[serde(default)]
    pub automation: Vec<AutomationTrack>,
    pub enabled: bool,
    pub muted: bool,
    pub soloed: bool,
    pub armed: bool,
    pub recording_mode: RecordingMode,
    /// Macro values in `[0, 1]`, modulator tracks only.
    #[serde(default)]
    pub macros: Vec<f32>,
}

impl Track {
    pub fn new(id: TrackId, name: impl Into<String>, kind: TrackKind) -> Self {
        let lanes = if kind.region_kind().is_some() {
            vec![Lane::new("Lane 1")]
        } else {
            Vec::new()
        };
        Self {
            id,
            name: name.into(),
            color: default_color(kind),
            kind,
            lanes,
            channel: kind.has_channel().then(Channel::default),
            automation: Vec::new(),
            enabled: true,
            muted: false,
            soloed: false,
            armed: false,
            recording_mode: RecordingMode::default(),
            macros: if kind == TrackKind::Modulator {
                vec![0.0; MACRO_COUNT]
            } else {
                Vec::new()
            },
        }
    }

    pub fn is_master(&self) -> bool {
        self.kind == TrackKind::Master
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> Option<&mut Channel> {
        self.channel.as_mut()
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.lanes.iter().flat_map(|lane| lane.regions.iter())
    }

    /// Lane index and region.
    pub fn find_region(&self, id: RegionId) -> Option<(usize, &Region)> {
        self.lanes
            .iter()
            .enumerate()
            .find_map(|(index, lane)| lane.region(id).map(|region| (index, region)))
    }

    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.lanes.iter_mut().find_map(|lane| lane.region_mut(id))
    }

    pub fn automation_regions(&self) -> impl Iterator<Item = &Region> {
        self.automation.iter().flat_map(|lane| lane.regions.iter())
    }

    pub fn ensure_lane(&mut self, index: usize) {
        while self.lanes.len() <= index {
            let name = format!("Lane {}", self.lanes.len() + 1);
            self.lanes.push(Lane::new(name));
        }
    }
}

fn default_color(kind: TrackKind) -> u32 {
    match kind {
        TrackKind::Audio => 0x3D8FD1,
        TrackKind::Midi | TrackKind::Instrument => 0x48B36B,
        TrackKind::Bus => 0xC98A2E,
        TrackKind::Chord => 0x9A5BC4,
        TrackKind::Marker => 0x7A7A7A,
        TrackKind::Modulator => 0xC44D6B,
        TrackKind::Master => 0xD0D0D0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ClipId;

    fn lane_with(regions: &[(u64, u64)], ids: &mut IdAllocator) -> Lane {
        let mut lane = Lane::new("test");
        for (position, length) in regions {
            lane.insert(Region::audio(ids.region(), *position, *length, ClipId(0)))
                .unwrap();
        }
        lane
    }

    #[test]
    fn insert_rejects_overlap() {
        let mut ids = IdAllocator::default();
        let mut lane = lane_with(&[(0, 10)], &mut ids);
        assert!(lane
            .insert(Region::audio(ids.region(), 5, 10, ClipId(0)))
            .is_err());
        assert!(lane
            .insert(Region::audio(ids.region(), 10, 10, ClipId(0)))
            .is_ok());
    }

    #[test]
    fn later_region_wins_overlaps() {
        let mut ids = IdAllocator::default();
        let mut lane = lane_with(&[(0, 100), (150, 20)], &mut ids);
        let winner = Region::audio(ids.region(), 40, 140, ClipId(0));
        let winner_id = winner.id;
        lane.insert_unchecked(winner);
        lane.resolve_overlaps(winner_id, &mut ids);

        assert!(lane.is_non_overlapping());
        let spans: Vec<_> = lane.regions.iter().map(|r| (r.position, r.length)).collect();
        assert_eq!(spans, vec![(0, 40), (40, 140)]);
    }

    #[test]
    fn region_inside_splits_its_host() {
        let mut ids = IdAllocator::default();
        let mut lane = lane_with(&[(0, 100)], &mut ids);
        let winner = Region::audio(ids.region(), 40, 20, ClipId(0));
        let winner_id = winner.id;
        lane.insert_unchecked(winner);
        lane.resolve_overlaps(winner_id, &mut ids);

        let spans: Vec<_> = lane.regions.iter().map(|r| (r.position, r.length)).collect();
        assert_eq!(spans, vec![(0, 40), (40, 20), (60, 40)]);
        assert_eq!(lane.regions[2].clip_start, 60);
    }

    #[test]
    fn only_content_tracks_get_lanes() {
        assert_eq!(Track::new(TrackId(0), "a", TrackKind::Audio).lanes.len(), 1);
        assert!(Track::new(TrackId(1), "b", TrackKind::Bus).lanes.is_empty());
        assert!(Track::new(TrackId(2), "m", TrackKind::Modulator).channel.is_none());
        assert_eq!(
            Track::new(TrackId(3), "m", TrackKind::Modulator).macros.len(),
            MACRO_COUNT
        );
    }
}
