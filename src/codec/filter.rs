//! Filter stages used by the enhancer
//!
//! Biquads follow the RBJ audio EQ cookbook in transposed direct form II.
//! All processing is in normalized `f32` samples (-1.0..=1.0).

use std::f32::consts::PI;

/// Second-order IIR section
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn omega(sample_rate: f32, freq: f32, q: f32) -> (f32, f32) {
        let freq = freq.clamp(1.0, sample_rate * 0.49);
        let w0 = 2.0 * PI * freq / sample_rate;
        (w0.cos(), w0.sin() / (2.0 * q.max(0.01)))
    }

    pub fn high_pass(sample_rate: f32, cutoff: f32, q: f32) -> Self {
        let (cos, alpha) = Self::omega(sample_rate, cutoff, q);
        Self::normalized(
            (1.0 + cos) / 2.0,
            -(1.0 + cos),
            (1.0 + cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    pub fn low_pass(sample_rate: f32, cutoff: f32, q: f32) -> Self {
        let (cos, alpha) = Self::omega(sample_rate, cutoff, q);
        Self::normalized(
            (1.0 - cos) / 2.0,
            1.0 - cos,
            (1.0 - cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    pub fn peaking(sample_rate: f32, center: f32, q: f32, gain_db: f32) -> Self {
        let (cos, alpha) = Self::omega(sample_rate, center, q);
        let a = 10f32.powf(gain_db / 40.0);
        Self::normalized(
            1.0 + alpha * a,
            -2.0 * cos,
            1.0 - alpha * a,
            1.0 + alpha / a,
            -2.0 * cos,
            1.0 - alpha / a,
        )
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Cascade of biquads applied in order
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    stages: Vec<Biquad>,
}

impl FilterChain {
    pub fn new(stages: Vec<Biquad>) -> Self {
        Self { stages }
    }

    pub fn process_block(&mut self, samples: &mut [f32]) {
        for stage in &mut self.stages {
            for s in samples.iter_mut() {
                *s = stage.process(*s);
            }
        }
    }

    pub fn reset(&mut self) {
        self.stages.iter_mut().for_each(Biquad::reset);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Downward expander that attenuates blocks near the tracked noise floor
#[derive(Debug, Clone)]
pub struct NoiseGate {
    noise_floor: f32,
    /// Blocks below `noise_floor * open_ratio` are attenuated
    open_ratio: f32,
    closed_gain: f32,
    gain: f32,
    /// Per-sample smoothing factor for gain changes
    smoothing: f32,
    /// Per-block upward drift of the floor estimate
    floor_rise: f32,
}

impl NoiseGate {
    const MIN_FLOOR: f32 = 1.0e-4;

    pub fn new() -> Self {
        Self {
            noise_floor: Self::MIN_FLOOR,
            open_ratio: 2.0,
            closed_gain: 0.1,
            gain: 1.0,
            smoothing: 0.005,
            floor_rise: 1.02,
        }
    }

    pub fn process_block(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }
        let rms = rms(samples);

        // Minimum-tracking floor: snaps down, drifts up slowly
        if rms < self.noise_floor {
            self.noise_floor = rms.max(Self::MIN_FLOOR);
        } else {
            self.noise_floor = (self.noise_floor * self.floor_rise).min(rms);
        }

        let target = if rms < self.noise_floor * self.open_ratio {
            self.closed_gain
        } else {
            1.0
        };

        for s in samples.iter_mut() {
            self.gain += (target - self.gain) * self.smoothing;
            *s *= self.gain;
        }
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self::new()
    }
}

const SOFT_KNEE: f32 = 0.9;

/// Bound a sample to -1.0..=1.0, compressing smoothly above the knee
#[inline]
pub fn soft_clip(x: f32) -> f32 {
    let mag = x.abs();
    if mag <= SOFT_KNEE {
        return x;
    }
    let headroom = 1.0 - SOFT_KNEE;
    let over = (mag - SOFT_KNEE) / headroom;
    (SOFT_KNEE + headroom * over.tanh()).copysign(x)
}

/// Root mean square of a block
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Convert decibels to a linear amplitude factor
pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f32 = 16_000.0;

    fn sine(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / RATE).sin())
            .collect()
    }

    fn settled_rms(chain: &mut FilterChain, freq: f32) -> f32 {
        let mut block = sine(freq, 0.5, 3200);
        chain.process_block(&mut block);
        rms(&block[1600..])
    }

    #[test]
    fn test_high_pass_attenuates_rumble() {
        let mut chain = FilterChain::new(vec![Biquad::high_pass(RATE, 200.0, 0.707)]);
        let low = settled_rms(&mut chain, 40.0);
        chain.reset();
        let high = settled_rms(&mut chain, 2000.0);
        assert!(low < 0.1, "low band rms {}", low);
        assert!(high > 0.3, "pass band rms {}", high);
    }

    #[test]
    fn test_peaking_boosts_center() {
        let mut boosted = FilterChain::new(vec![Biquad::peaking(RATE, 2500.0, 1.0, 6.0)]);
        let centre = settled_rms(&mut boosted, 2500.0);
        let flat = rms(&sine(2500.0, 0.5, 1600));
        assert!(centre > flat * 1.8);
    }

    #[test]
    fn test_soft_clip_is_bounded() {
        assert_eq!(soft_clip(0.5), 0.5);
        assert_eq!(soft_clip(-0.9), -0.9);
        for x in [1.0f32, 2.0, 10.0, 1e6] {
            assert!(soft_clip(x) <= 1.0);
            assert!(soft_clip(-x) >= -1.0);
            assert!(soft_clip(x) > SOFT_KNEE);
        }
    }

    #[test]
    fn test_noise_gate_attenuates_floor() {
        let mut gate = NoiseGate::new();
        let mut quiet = Vec::new();
        for _ in 0..400 {
            let mut block = sine(300.0, 0.01, 320);
            gate.process_block(&mut block);
            quiet = block;
        }
        assert!(rms(&quiet) < 0.01 * 0.707 * 0.5);

        let mut loud = Vec::new();
        for _ in 0..10 {
            let mut block = sine(300.0, 0.5, 320);
            gate.process_block(&mut block);
            loud = block;
        }
        assert!(rms(&loud) > 0.3);
    }

    #[test]
    fn test_db_to_linear() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(6.0) - 1.995).abs() < 0.01);
        assert!((db_to_linear(12.0) - 3.981).abs() < 0.01);
    }
}
