//! Meter readbacks published by the audio thread.

use atomic_float::AtomicF32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterReading {
    pub peak: f32,
    pub rms: f32,
}

/// Single-writer meter value. The audio thread calls [`MeterCell::update`]
/// once per cycle, observers call [`MeterCell::read`].
#[derive(Clone, Default)]
pub struct MeterCell {
    peak: Arc<AtomicF32>,
    rms: Arc<AtomicF32>,
}

impl MeterCell {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let mut peak = 0.0_f32;
        let mut sum = 0.0_f32;
        for sample in samples {
            peak = peak.max(sample.abs());
            sum += sample * sample;
        }
        self.peak.store(peak, Ordering::Relaxed);
        self.rms
            .store((sum / samples.len() as f32).sqrt(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.peak.store(0.0, Ordering::Relaxed);
        self.rms.store(0.0, Ordering::Relaxed);
    }

    pub fn read(&self) -> MeterReading {
        MeterReading {
            peak: self.peak.load(Ordering::Relaxed),
            rms: self.rms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_wave_reading() {
        let meter = MeterCell::new();
        meter.update(&[0.5, -0.5, 0.5, -0.5]);
        let reading = meter.read();
        assert_eq!(reading.peak, 0.5);
        assert!((reading.rms - 0.5).abs() < 1e-6);
    }
}
