use std::f32::consts::FRAC_PI_2;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Shape of the segment that starts at a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CurveKind {
    #[default]
    Linear,
    Exponential,
    Logarithmic,
    SuperEllipse,
    Vital,
    Pulse,
    Step,
}

impl CurveKind {
    pub const ALL: [CurveKind; 7] = [
        CurveKind::Linear,
        CurveKind::Exponential,
        CurveKind::Logarithmic,
        CurveKind::SuperEllipse,
        CurveKind::Vital,
        CurveKind::Pulse,
        CurveKind::Step,
    ];

    /// Maps progress `x` in `[0, 1]` to `[0, 1]`. `curviness` in `[-1, 1]`
    /// bends the shape; linear ignores it.
    pub fn shape(self, x: f32, curviness: f32) -> f32 {
        let x = x.clamp(0.0, 1.0);
        let c = if curviness.is_finite() {
            curviness.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        match self {
            CurveKind::Linear => x,
            CurveKind::Exponential => {
                let k = (4.0 * (1.0 + c)).max(0.01);
                (k * x).exp_m1() / k.exp_m1()
            }
            CurveKind::Logarithmic => {
                let k = (16.0 * (1.0 + c)).max(0.01);
                (k * x).ln_1p() / k.ln_1p()
            }
            CurveKind::SuperEllipse => {
                let n = 2f32.powf(2.0 * c);
                1.0 - (1.0 - x.powf(n)).max(0.0).powf(n.recip())
            }
            CurveKind::Vital => {
                let s = 10.0 * c;
                if s.abs() < 1e-4 {
                    x
                } else {
                    (s * x).exp_m1() / s.exp_m1()
                }
            }
            CurveKind::Pulse => {
                if x < (1.0 + c) * 0.5 {
                    0.0
                } else {
                    1.0
                }
            }
            CurveKind::Step => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    /// Region-local position in samples.
    pub position: u64,
    /// Normalized value in `[0, 1]`.
    pub value: f32,
    pub curve: CurveKind,
    pub curviness: f32,
}

impl AutomationPoint {
    pub fn new(position: u64, value: f32, curve: CurveKind) -> Self {
        Self {
            position,
            value: value.clamp(0.0, 1.0),
            curve,
            curviness: 0.0,
        }
    }

    pub fn with_curviness(mut self, curviness: f32) -> Self {
        self.curviness = curviness.clamp(-1.0, 1.0);
        self
    }
}

/// Time-ordered points. Positions strictly increase; adding a point at an
/// existing position replaces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationCurve {
    points: Vec<AutomationPoint>,
}

impl AutomationCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: impl IntoIterator<Item = AutomationPoint>) -> Self {
        let mut curve = Self::new();
        for point in points {
            curve.add_point(point);
        }
        curve
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[AutomationPoint] {
        &self.points
    }

    pub fn get(&self, index: usize) -> Option<&AutomationPoint> {
        self.points.get(index)
    }

    /// Inserts in position order and returns the index of the point.
    pub fn add_point(&mut self, point: AutomationPoint) -> usize {
        match self
            .points
            .binary_search_by_key(&point.position, |existing| existing.position)
        {
            Ok(index) => {
                self.points[index] = point;
                index
            }
            Err(index) => {
                self.points.insert(index, point);
                index
            }
        }
    }

    pub fn remove_point(&mut self, index: usize) -> Option<AutomationPoint> {
        (index < self.points.len()).then(|| self.points.remove(index))
    }

    /// Removes every point in `[start, end)`.
    pub fn clear_range(&mut self, start: u64, end: u64) {
        let range = self.range_indices(start, end);
        self.points.drain(range);
    }

    pub fn value_at(&self, position: u64) -> Option<f32> {
        if self.points.is_empty() {
            return None;
        }

        let index = self.points.partition_point(|point| point.position <= position);
        if index == 0 {
            return Some(self.points[0].value);
        }

        let prev = &self.points[index - 1];
        if prev.position == position || index == self.points.len() {
            return Some(prev.value);
        }

        let next = &self.points[index];
        let span = next.position.saturating_sub(prev.position);
        if span == 0 {
            return Some(next.value);
        }
        let x = (position - prev.position) as f32 / span as f32;
        let y = prev.curve.shape(x, prev.curviness);
        Some(prev.value + (next.value - prev.value) * y)
    }

    pub fn range_indices(&self, start: u64, end: u64) -> Range<usize> {
        if start >= end {
            return 0..0;
        }
        let start_index = self.points.partition_point(|point| point.position < start);
        let end_index = self.points.partition_point(|point| point.position < end);
        start_index..end_index
    }

    pub fn is_strictly_ordered(&self) -> bool {
        self.points
            .windows(2)
            .all(|pair| pair[0].position < pair[1].position)
    }
}

/// Gain envelope used for region fades.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum FadeCurve {
    #[default]
    Linear,
    EqualPower,
    Curve { kind: CurveKind, curviness: f32 },
}

impl FadeCurve {
    pub fn gain_in(self, progress: f32) -> f32 {
        let progress = progress.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => progress,
            FadeCurve::EqualPower => (FRAC_PI_2 * progress).sin(),
            FadeCurve::Curve { kind, curviness } => kind.shape(progress, curviness),
        }
    }

    pub fn gain_out(self, progress: f32) -> f32 {
        let progress = progress.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => 1.0 - progress,
            FadeCurve::EqualPower => (FRAC_PI_2 * progress).cos(),
            FadeCurve::Curve { kind, curviness } => 1.0 - kind.shape(progress, curviness),
        }
    }
}
