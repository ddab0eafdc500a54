//! Typed signal endpoints.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use atomic_float::AtomicF32;
use serde::{Deserialize, Serialize};

use crate::midi::{MidiBuffer, DEFAULT_MIDI_CAPACITY};

/// Stable identity of a processable. Survives graph rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub u64);

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A port is addressed by its owner and its index in the owner's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId {
    pub node: NodeKey,
    pub index: u16,
}

impl PortId {
    pub const fn new(node: NodeKey, index: u16) -> Self {
        Self { node, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    Audio,
    Cv,
    Midi,
    Control,
}

impl PortKind {
    /// Whether an output of this kind may feed an input of `dest`.
    pub fn can_feed(self, dest: PortKind) -> bool {
        matches!(
            (self, dest),
            (PortKind::Audio, PortKind::Audio)
                | (PortKind::Cv, PortKind::Cv)
                | (PortKind::Cv, PortKind::Control)
                | (PortKind::Control, PortKind::Control)
                | (PortKind::Midi, PortKind::Midi)
        )
    }

    pub fn is_audio_rate(self) -> bool {
        matches!(self, PortKind::Audio | PortKind::Cv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl PortRange {
    pub fn new(min: f32, max: f32, default: f32) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            default: default.clamp(min, max),
        }
    }

    pub fn unit() -> Self {
        Self::new(0.0, 1.0, 0.0)
    }

    pub fn bipolar() -> Self {
        Self::new(-1.0, 1.0, 0.0)
    }

    pub fn span(&self) -> f32 {
        self.max - self.min
    }

    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            return self.default;
        }
        value.clamp(self.min, self.max)
    }

    pub fn normalize(&self, value: f32, flags: PortFlags) -> f32 {
        let span = self.span();
        if span <= f32::EPSILON {
            return 0.0;
        }
        let value = self.clamp(value);
        if flags.logarithmic && self.min > 0.0 {
            (value / self.min).ln() / (self.max / self.min).ln()
        } else {
            (value - self.min) / span
        }
    }

    pub fn denormalize(&self, normalized: f32, flags: PortFlags) -> f32 {
        let normalized = normalized.clamp(0.0, 1.0);
        let value = if flags.logarithmic && self.min > 0.0 {
            self.min * (self.max / self.min).powf(normalized)
        } else {
            self.min + normalized * self.span()
        };
        self.snap(value, flags)
    }

    /// Applies toggle and integer constraints.
    pub fn snap(&self, value: f32, flags: PortFlags) -> f32 {
        let value = self.clamp(value);
        if flags.toggle {
            if value >= self.min + self.span() * 0.5 {
                self.max
            } else {
                self.min
            }
        } else if flags.integer {
            self.clamp(value.round())
        } else {
            value
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::unit()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFlags {
    pub toggle: bool,
    pub integer: bool,
    pub logarithmic: bool,
    pub automatable: bool,
}

impl PortFlags {
    pub fn automatable() -> Self {
        Self {
            automatable: true,
            ..Self::default()
        }
    }

    pub fn toggle() -> Self {
        Self {
            toggle: true,
            automatable: true,
            ..Self::default()
        }
    }
}

/// Static declaration of one port in a processable's layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub kind: PortKind,
    pub direction: PortDirection,
    pub range: PortRange,
    pub flags: PortFlags,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, kind: PortKind, direction: PortDirection) -> Self {
        let range = match kind {
            PortKind::Audio | PortKind::Cv => PortRange::bipolar(),
            _ => PortRange::unit(),
        };
        Self {
            name: name.into(),
            kind,
            direction,
            range,
            flags: PortFlags::default(),
        }
    }

    pub fn audio_in(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Audio, PortDirection::Input)
    }

    pub fn audio_out(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Audio, PortDirection::Output)
    }

    pub fn midi_in(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Midi, PortDirection::Input)
    }

    pub fn midi_out(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Midi, PortDirection::Output)
    }

    pub fn cv_in(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Cv, PortDirection::Input)
    }

    pub fn cv_out(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Cv, PortDirection::Output)
    }

    pub fn control(name: impl Into<String>, range: PortRange) -> Self {
        Self {
            range,
            flags: PortFlags::automatable(),
            ..Self::new(name, PortKind::Control, PortDirection::Input)
        }
    }

    pub fn control_out(name: impl Into<String>, range: PortRange) -> Self {
        Self {
            range,
            ..Self::new(name, PortKind::Control, PortDirection::Output)
        }
    }

    pub fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }

    pub fn is_output(&self) -> bool {
        self.direction == PortDirection::Output
    }
}

/// Shared, always-clamped value of a control port.
///
/// The cell outlives graph rebuilds so a parameter keeps its value when the
/// topology changes. Writes from any thread are clamped to the port range.
#[derive(Clone)]
pub struct ControlCell {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    range: PortRange,
    flags: PortFlags,
    value: AtomicF32,
}

impl ControlCell {
    pub fn new(range: PortRange, flags: PortFlags) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                range,
                flags,
                value: AtomicF32::new(range.snap(range.default, flags)),
            }),
        }
    }

    pub fn for_spec(spec: &PortSpec) -> Self {
        Self::new(spec.range, spec.flags)
    }

    pub fn range(&self) -> PortRange {
        self.inner.range
    }

    pub fn flags(&self) -> PortFlags {
        self.inner.flags
    }

    #[inline]
    pub fn get(&self) -> f32 {
        self.inner.value.load(Ordering::Acquire)
    }

    /// Stores `value` after clamping and returns what was stored.
    #[inline]
    pub fn set(&self, value: f32) -> f32 {
        let value = self.inner.range.snap(value, self.inner.flags);
        self.inner.value.store(value, Ordering::Release);
        value
    }

    pub fn get_normalized(&self) -> f32 {
        self.inner.range.normalize(self.get(), self.inner.flags)
    }

    pub fn set_normalized(&self, normalized: f32) -> f32 {
        self.set(self.inner.range.denormalize(normalized, self.inner.flags))
    }

    pub fn reset(&self) {
        self.set(self.inner.range.default);
    }

    pub fn shares_storage_with(&self, other: &ControlCell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ControlCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlCell")
            .field("range", &self.inner.range)
            .field("value", &self.get())
            .finish()
    }
}

/// Current contents of a port inside a compiled graph.
#[derive(Debug, Clone)]
pub enum PortValue {
    Audio(Vec<f32>),
    Cv(Vec<f32>),
    Midi(MidiBuffer),
    Control(f32),
}

/// A port as owned by a node of a compiled graph.
#[derive(Debug, Clone)]
pub struct Port {
    pub id: PortId,
    pub spec: PortSpec,
    pub value: PortValue,
    /// Backing cell for control inputs, shared with the control domain.
    pub cell: Option<ControlCell>,
}

impl Port {
    pub fn new(id: PortId, spec: PortSpec, block_size: usize) -> Self {
        let value = match spec.kind {
            PortKind::Audio => PortValue::Audio(vec![0.0; block_size]),
            PortKind::Cv => PortValue::Cv(vec![0.0; block_size]),
            PortKind::Midi => PortValue::Midi(MidiBuffer::with_capacity(DEFAULT_MIDI_CAPACITY)),
            PortKind::Control => PortValue::Control(spec.range.default),
        };
        Self {
            id,
            spec,
            value,
            cell: None,
        }
    }

    pub fn owner(&self) -> NodeKey {
        self.id.node
    }

    pub fn kind(&self) -> PortKind {
        self.spec.kind
    }

    /// Control value, clamped on write.
    pub fn control(&self) -> f32 {
        match &self.value {
            PortValue::Control(value) => *value,
            _ => 0.0,
        }
    }

    pub fn set_control(&mut self, value: f32) {
        if let PortValue::Control(slot) = &mut self.value {
            *slot = self.spec.range.snap(value, self.spec.flags);
        }
    }

    pub fn samples(&self) -> &[f32] {
        match &self.value {
            PortValue::Audio(buf) | PortValue::Cv(buf) => buf,
            _ => &[],
        }
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        match &mut self.value {
            PortValue::Audio(buf) | PortValue::Cv(buf) => buf,
            _ => &mut [],
        }
    }

    pub fn midi(&self) -> Option<&MidiBuffer> {
        match &self.value {
            PortValue::Midi(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn midi_mut(&mut self) -> Option<&mut MidiBuffer> {
        match &mut self.value {
            PortValue::Midi(buf) => Some(buf),
            _ => None,
        }
    }

    /// Clears `[offset, offset + frames)` of a buffer port, or the whole
    /// range of MIDI events in that window.
    pub fn clear_range(&mut self, offset: usize, frames: usize) {
        match &mut self.value {
            PortValue::Audio(buf) | PortValue::Cv(buf) => {
                let end = (offset + frames).min(buf.len());
                if offset < end {
                    buf[offset..end].fill(0.0);
                }
            }
            PortValue::Midi(buf) => buf.clear_range(offset as u32, (offset + frames) as u32),
            PortValue::Control(_) => {}
        }
    }
}
