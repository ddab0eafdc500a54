//! Parameter automation: curves, per-parameter lanes and the recorder that
//! writes points while the transport records.

pub mod curve;
pub mod record;

use serde::{Deserialize, Serialize};

pub use curve::{AutomationCurve, AutomationPoint, CurveKind, FadeCurve};
pub use record::AutomationRecorder;

use crate::error::ActionError;
use crate::ids::RegionId;
use crate::model::{ParamAddress, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AutomationMode {
    #[default]
    Read,
    Write,
    Touch,
    Latch,
}

/// Automation regions of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationTrack {
    pub target: ParamAddress,
    pub mode: AutomationMode,
    pub regions: Vec<Region>,
}

impl AutomationTrack {
    pub fn new(target: ParamAddress) -> Self {
        Self {
            target,
            mode: AutomationMode::Read,
            regions: Vec::new(),
        }
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.iter().find(|region| region.id == id)
    }

    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.iter_mut().find(|region| region.id == id)
    }

    pub fn region_at(&self, position: u64) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(position))
    }

    pub fn region_at_mut(&mut self, position: u64) -> Option<&mut Region> {
        self.regions.iter_mut().find(|region| region.contains(position))
    }

    pub fn insert(&mut self, region: Region) -> Result<(), ActionError> {
        if region.curve().is_none() {
            return Err(ActionError::invalid(format!("{} is not an automation region", region.id)));
        }
        if self
            .regions
            .iter()
            .any(|existing| existing.overlaps(region.position, region.end()))
        {
            return Err(ActionError::invalid(format!(
                "{} overlaps automation of {}",
                region.id, self.target
            )));
        }
        let index = self
            .regions
            .partition_point(|existing| existing.position <= region.position);
        self.regions.insert(index, region);
        Ok(())
    }

    pub fn remove(&mut self, id: RegionId) -> Option<Region> {
        let index = self.regions.iter().position(|region| region.id == id)?;
        Some(self.regions.remove(index))
    }

    /// Normalized value at timeline `position`.
    pub fn value_at(&self, position: u64) -> Option<f32> {
        self.region_at(position)?.automation_value(position)
    }

    pub fn is_non_overlapping(&self) -> bool {
        let mut spans: Vec<_> = self.regions.iter().map(|r| (r.position, r.end())).collect();
        spans.sort_unstable();
        spans.windows(2).all(|pair| pair[0].1 <= pair[1].0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TrackId;

    #[test]
    fn value_comes_from_the_covering_region() {
        let mut lane = AutomationTrack::new(ParamAddress::amp(TrackId(1)));
        let mut region = Region::automation(RegionId(0), 100, 100);
        region
            .curve_mut()
            .unwrap()
            .add_point(AutomationPoint::new(0, 0.25, CurveKind::Linear));
        lane.insert(region).unwrap();

        assert_eq!(lane.value_at(50), None);
        assert_eq!(lane.value_at(150), Some(0.25));
        assert!(lane.insert(Region::automation(RegionId(1), 150, 10)).is_err());
        assert!(lane.insert(Region::midi(RegionId(2), 300, 10)).is_err());
    }
}
