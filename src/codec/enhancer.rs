//! Listener-side audio enhancement
//!
//! Each filter mode maps to a static processing profile (filter stages, base
//! gain, noise gate). The [`Enhancer`] keeps per-stream filter state and runs
//! inline on the playback thread.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};

use super::filter::{db_to_linear, soft_clip, Biquad, FilterChain, NoiseGate};
use crate::constants::SAMPLE_RATE;

/// Upper bound of the user gain boost
pub const MAX_GAIN_BOOST_DB: f32 = 12.0;

/// Enhancement filter selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    Original,
    /// Speech band emphasis with noise floor suppression
    Voice,
    /// Maximum linear gain for distant sources
    QuietSounds,
    /// Minimal processing
    Music,
    /// Wind and rumble attenuation
    Outdoor,
}

/// Overall output level tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeMode {
    Quiet,
    #[default]
    Normal,
    Loud,
}

#[derive(Debug, Clone, Copy)]
enum StageSpec {
    HighPass { hz: f32, q: f32 },
    LowPass { hz: f32, q: f32 },
    Peaking { hz: f32, q: f32, gain_db: f32 },
}

/// Processing attached to a filter mode
#[derive(Debug)]
struct ModeProfile {
    stages: &'static [StageSpec],
    base_gain: f32,
    gate: bool,
}

static ORIGINAL: ModeProfile = ModeProfile {
    stages: &[],
    base_gain: 1.0,
    gate: false,
};

static VOICE: ModeProfile = ModeProfile {
    stages: &[
        StageSpec::HighPass { hz: 100.0, q: 0.707 },
        StageSpec::Peaking { hz: 2500.0, q: 1.0, gain_db: 6.0 },
        StageSpec::LowPass { hz: 7000.0, q: 0.707 },
    ],
    base_gain: 1.4,
    gate: true,
};

static QUIET_SOUNDS: ModeProfile = ModeProfile {
    stages: &[StageSpec::HighPass { hz: 60.0, q: 0.707 }],
    base_gain: 4.0,
    gate: false,
};

static MUSIC: ModeProfile = ModeProfile {
    stages: &[],
    base_gain: 1.0,
    gate: false,
};

static OUTDOOR: ModeProfile = ModeProfile {
    stages: &[
        StageSpec::HighPass { hz: 200.0, q: 0.707 },
        StageSpec::HighPass { hz: 200.0, q: 0.707 },
        StageSpec::Peaking { hz: 1000.0, q: 0.9, gain_db: 3.0 },
    ],
    base_gain: 1.2,
    gate: false,
};

impl FilterMode {
    pub const ALL: [FilterMode; 5] = [
        FilterMode::Original,
        FilterMode::Voice,
        FilterMode::QuietSounds,
        FilterMode::Music,
        FilterMode::Outdoor,
    ];

    fn profile(self) -> &'static ModeProfile {
        match self {
            FilterMode::Original => &ORIGINAL,
            FilterMode::Voice => &VOICE,
            FilterMode::QuietSounds => &QUIET_SOUNDS,
            FilterMode::Music => &MUSIC,
            FilterMode::Outdoor => &OUTDOOR,
        }
    }

    fn build_chain(self, sample_rate: f32) -> FilterChain {
        let stages = self
            .profile()
            .stages
            .iter()
            .map(|spec| match *spec {
                StageSpec::HighPass { hz, q } => Biquad::high_pass(sample_rate, hz, q),
                StageSpec::LowPass { hz, q } => Biquad::low_pass(sample_rate, hz, q),
                StageSpec::Peaking { hz, q, gain_db } => Biquad::peaking(sample_rate, hz, q, gain_db),
            })
            .collect();
        FilterChain::new(stages)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterMode::Original => "original",
            FilterMode::Voice => "voice",
            FilterMode::QuietSounds => "quiet_sounds",
            FilterMode::Music => "music",
            FilterMode::Outdoor => "outdoor",
        }
    }
}

impl VolumeMode {
    /// Linear gain multiplier of the tier
    pub fn gain(self) -> f32 {
        match self {
            VolumeMode::Quiet => 0.5,
            VolumeMode::Normal => 1.0,
            VolumeMode::Loud => 2.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VolumeMode::Quiet => "quiet",
            VolumeMode::Normal => "normal",
            VolumeMode::Loud => "loud",
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        FilterMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| format!("Unknown filter mode: {}", s))
    }
}

impl FromStr for VolumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quiet" => Ok(VolumeMode::Quiet),
            "normal" => Ok(VolumeMode::Normal),
            "loud" => Ok(VolumeMode::Loud),
            _ => Err(format!("Unknown volume mode: {}", s)),
        }
    }
}

fn clamp_gain_boost(db: f32) -> f32 {
    if db.is_nan() {
        0.0
    } else {
        db.clamp(0.0, MAX_GAIN_BOOST_DB)
    }
}

fn deserialize_gain_boost<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    f32::deserialize(deserializer).map(clamp_gain_boost)
}

/// Enhancement settings read by the playback loop on every frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancerConfig {
    pub filter_mode: FilterMode,
    pub volume_mode: VolumeMode,
    pub noise_suppression: bool,
    #[serde(deserialize_with = "deserialize_gain_boost")]
    gain_boost_db: f32,
}

impl EnhancerConfig {
    pub fn new(
        filter_mode: FilterMode,
        volume_mode: VolumeMode,
        noise_suppression: bool,
        gain_boost_db: f32,
    ) -> Self {
        Self {
            filter_mode,
            volume_mode,
            noise_suppression,
            gain_boost_db: clamp_gain_boost(gain_boost_db),
        }
    }

    /// Gain boost in decibels, always within `0..=12`
    pub fn gain_boost_db(&self) -> f32 {
        self.gain_boost_db
    }

    /// Set the gain boost; out-of-range values are clamped
    pub fn set_gain_boost_db(&mut self, db: f32) {
        self.gain_boost_db = clamp_gain_boost(db);
    }

    pub fn with_gain_boost_db(mut self, db: f32) -> Self {
        self.set_gain_boost_db(db);
        self
    }

    pub fn with_filter_mode(mut self, mode: FilterMode) -> Self {
        self.filter_mode = mode;
        self
    }

    pub fn with_volume_mode(mut self, mode: VolumeMode) -> Self {
        self.volume_mode = mode;
        self
    }

    /// Whether the configuration leaves samples untouched
    pub fn is_passthrough(&self) -> bool {
        self.filter_mode == FilterMode::Original
            && self.volume_mode == VolumeMode::Normal
            && !self.noise_suppression
            && self.gain_boost_db == 0.0
    }

    /// Combined linear gain of the mode, volume tier and boost
    pub fn total_gain(&self) -> f32 {
        self.filter_mode.profile().base_gain * self.volume_mode.gain() * db_to_linear(self.gain_boost_db)
    }
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self::new(FilterMode::Original, VolumeMode::Normal, false, 0.0)
    }
}

/// Enhancer configuration shared between a control source and the playback loop.
///
/// Updates replace the whole value under a write lock, so readers always see
/// a complete configuration.
#[derive(Debug, Clone, Default)]
pub struct SharedEnhancerConfig {
    inner: Arc<RwLock<EnhancerConfig>>,
}

impl SharedEnhancerConfig {
    pub fn new(config: EnhancerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Consistent copy of the current configuration
    pub fn snapshot(&self) -> EnhancerConfig {
        *self.inner.read()
    }

    /// Replace the configuration
    pub fn store(&self, config: EnhancerConfig) {
        *self.inner.write() = config;
    }

    /// Derive a new configuration from the current one and swap it in
    pub fn update(&self, f: impl FnOnce(EnhancerConfig) -> EnhancerConfig) -> EnhancerConfig {
        let mut guard = self.inner.write();
        *guard = f(*guard);
        *guard
    }
}

/// Per-stream enhancement state
pub struct Enhancer {
    sample_rate: f32,
    mode: FilterMode,
    chain: FilterChain,
    gate: NoiseGate,
    scratch: Vec<f32>,
    frames_processed: u64,
}

impl Enhancer {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate as f32;
        Self {
            sample_rate,
            mode: FilterMode::Original,
            chain: FilterMode::Original.build_chain(sample_rate),
            gate: NoiseGate::new(),
            scratch: Vec::new(),
            frames_processed: 0,
        }
    }

    /// Process one frame of samples
    pub fn process(&mut self, input: &[i16], config: &EnhancerConfig) -> Vec<i16> {
        let mut out = Vec::with_capacity(input.len());
        self.process_into(input, config, &mut out);
        out
    }

    /// Process one frame into `out`, replacing its contents
    pub fn process_into(&mut self, input: &[i16], config: &EnhancerConfig, out: &mut Vec<i16>) {
        self.frames_processed += 1;
        out.clear();

        if config.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }

        if config.filter_mode != self.mode {
            tracing::debug!("Enhancer mode {} -> {}", self.mode, config.filter_mode);
            self.mode = config.filter_mode;
            self.chain = config.filter_mode.build_chain(self.sample_rate);
            self.gate.reset();
        }

        self.scratch.clear();
        self.scratch
            .extend(input.iter().map(|&s| s as f32 / i16::MAX as f32));

        self.chain.process_block(&mut self.scratch);

        if config.noise_suppression || config.filter_mode.profile().gate {
            self.gate.process_block(&mut self.scratch);
        }

        let gain = config.total_gain();
        out.extend(self.scratch.iter().map(|&s| {
            let y = soft_clip(s * gain) * i16::MAX as f32;
            y.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
        }));
    }

    /// Clear filter state, e.g. when a new stream starts
    pub fn reset(&mut self) {
        self.chain.reset();
        self.gate.reset();
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }
}

impl Default for Enhancer {
    fn default() -> Self {
        Self::new(SAMPLE_RATE)
    }
}
