use super::AutomationMode;

/// Value changes smaller than this are not written as new points.
const MIN_DELTA: f32 = 1.0e-4;

/// Touch state and captured values of one parameter while recording.
#[derive(Debug, Clone)]
pub struct AutomationRecorder {
    mode: AutomationMode,
    touching: bool,
    latched: bool,
    /// Timeline position and normalized value.
    points: Vec<(u64, f32)>,
}

impl AutomationRecorder {
    pub fn new(mode: AutomationMode) -> Self {
        Self {
            mode,
            touching: false,
            latched: false,
            points: Vec::new(),
        }
    }

    pub fn mode(&self) -> AutomationMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: AutomationMode) {
        self.mode = mode;
        if mode != AutomationMode::Latch {
            self.latched = false;
        }
        if !matches!(mode, AutomationMode::Touch | AutomationMode::Latch) {
            self.touching = false;
        }
    }

    pub fn begin_touch(&mut self) -> bool {
        match self.mode {
            AutomationMode::Read => false,
            AutomationMode::Write => true,
            AutomationMode::Touch => {
                self.touching = true;
                true
            }
            AutomationMode::Latch => {
                self.latched = true;
                self.touching = true;
                true
            }
        }
    }

    /// Returns true when releasing stopped writing.
    pub fn end_touch(&mut self) -> bool {
        match self.mode {
            AutomationMode::Read | AutomationMode::Write => false,
            AutomationMode::Touch => std::mem::replace(&mut self.touching, false),
            AutomationMode::Latch => {
                self.touching = false;
                false
            }
        }
    }

    pub fn is_touching(&self) -> bool {
        self.touching
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    pub fn can_write(&self) -> bool {
        match self.mode {
            AutomationMode::Read => false,
            AutomationMode::Write => true,
            AutomationMode::Touch => self.touching,
            AutomationMode::Latch => self.touching || self.latched,
        }
    }

    /// Whether playback should drive the parameter from its lane right now.
    pub fn reads(&self) -> bool {
        !self.can_write()
    }

    /// Captures a value if the mode allows writing. Repeated values are
    /// thinned out.
    pub fn record(&mut self, position: u64, value: f32) -> bool {
        if !self.can_write() {
            return false;
        }
        let value = value.clamp(0.0, 1.0);
        if let Some(last) = self.points.last_mut() {
            if last.0 == position {
                last.1 = value;
                return true;
            }
            if position > last.0 && (last.1 - value).abs() < MIN_DELTA {
                return false;
            }
        }
        self.points.push((position, value));
        true
    }

    pub fn has_points(&self) -> bool {
        !self.points.is_empty()
    }

    pub fn take_points(&mut self) -> Vec<(u64, f32)> {
        self.latched = false;
        std::mem::take(&mut self.points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_mode_requires_active_touch() {
        let mut recorder = AutomationRecorder::new(AutomationMode::Touch);
        assert!(!recorder.can_write());
        assert!(recorder.begin_touch());
        assert!(recorder.can_write());
        assert!(recorder.end_touch());
        assert!(!recorder.can_write());
    }

    #[test]
    fn latch_mode_sticks_after_touch() {
        let mut recorder = AutomationRecorder::new(AutomationMode::Latch);
        assert!(recorder.begin_touch());
        assert!(!recorder.end_touch());
        assert!(recorder.can_write());
        recorder.take_points();
        assert!(!recorder.can_write());
    }

    #[test]
    fn read_mode_never_records() {
        let mut recorder = AutomationRecorder::new(AutomationMode::Read);
        assert!(!recorder.begin_touch());
        assert!(!recorder.record(0, 0.5));
        assert!(recorder.reads());
    }

    #[test]
    fn repeated_values_are_thinned() {
        let mut recorder = AutomationRecorder::new(AutomationMode::Write);
        assert!(recorder.record(0, 0.5));
        assert!(!recorder.record(10, 0.5));
        assert!(recorder.record(20, 0.7));
        assert!(recorder.record(20, 0.8));
        assert_eq!(recorder.take_points(), vec![(0, 0.5), (20, 0.8)]);
        assert!(!recorder.has_points());
    }
}
