//! Streaming linear resampler
//!
//! Keeps the fractional read position and the last input sample between
//! blocks so consecutive frames join without clicks.

/// Mono linear-interpolation resampler
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    last: f32,
}

impl LinearResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            step: input_rate as f64 / output_rate.max(1) as f64,
            pos: 0.0,
            last: 0.0,
        }
    }

    /// Whether input and output rates match
    pub fn is_identity(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    /// Resample `input`, appending to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let n = input.len();
        if n == 0 {
            return;
        }
        if self.is_identity() {
            out.extend_from_slice(input);
            self.last = input[n - 1];
            return;
        }

        let last = self.last;
        let sample_at = |i: isize| if i < 0 { last } else { input[i as usize] };

        while self.pos < (n - 1) as f64 {
            let base = self.pos.floor();
            let frac = (self.pos - base) as f32;
            let a = sample_at(base as isize);
            let b = sample_at(base as isize + 1);
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        self.pos -= n as f64;
        self.last = input[n - 1];
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.last = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsample_length() {
        let mut resampler = LinearResampler::new(16_000, 48_000);
        let mut out = Vec::new();
        for _ in 0..50 {
            resampler.process(&[0.25; 320], &mut out);
        }
        let expected = 50 * 960;
        assert!((out.len() as i64 - expected as i64).abs() <= 4, "{}", out.len());
    }

    #[test]
    fn test_downsample_length() {
        let mut resampler = LinearResampler::new(48_000, 16_000);
        let mut out = Vec::new();
        for _ in 0..10 {
            resampler.process(&[0.0; 480], &mut out);
        }
        assert!((out.len() as i64 - 1600).abs() <= 2, "{}", out.len());
    }

    #[test]
    fn test_identity_passthrough() {
        let mut resampler = LinearResampler::new(16_000, 16_000);
        let mut out = Vec::new();
        resampler.process(&[0.1, 0.2, 0.3], &mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_interpolates_between_samples() {
        let mut resampler = LinearResampler::new(1, 2);
        let mut out = Vec::new();
        resampler.process(&[0.0, 1.0, 0.0], &mut out);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 0.5]);
    }
}
