//! Polyphase multirate decimation for XT32 filters.
//!
//! XT32 receivers store a correction filter as a sequence of time bands, each
//! at a quarter of the previous band's sample rate. [`convert_xt32`] turns a
//! full-rate impulse response of a known length into that banded layout:
//! every band but the last keeps a delay-compensated, window-tapered slice of
//! the current residual, and the remainder is decimated by four for the next
//! band.

use std::f64::consts::PI;

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::taps;

/// Every stage decimates by this factor.
pub const DECIMATION_FACTOR: usize = 4;

// ============================================================================
// Configuration
// ============================================================================

/// One decimation stage: its FIR split into polyphase components.
#[derive(Debug, Clone)]
pub struct DecimationStage {
    pub phases: Vec<Vec<f64>>,
    pub tap_count: usize,
    pub delay_compensation: bool,
}

impl DecimationStage {
    fn new(taps: &[f64], delay_compensation: bool) -> Self {
        Self {
            phases: decompose(taps, DECIMATION_FACTOR),
            tap_count: taps.len(),
            delay_compensation,
        }
    }

    /// Samples copied verbatim ahead of the tapered region.
    pub fn delay(&self) -> usize {
        if self.delay_compensation {
            (self.tap_count * 3).saturating_sub(3) / 2
        } else {
            0
        }
    }
}

/// Fixed layout for one source class.
#[derive(Debug, Clone)]
pub struct MultirateConfig {
    pub name: &'static str,
    pub input_len: usize,
    pub output_len: usize,
    /// One entry per output band; the last band has no stage.
    pub band_lengths: Vec<usize>,
    pub stages: Vec<DecimationStage>,
}

/// XT32 subwoofer: 16055 samples in, 704 out.
pub static XT32_SUB: Lazy<MultirateConfig> = Lazy::new(|| MultirateConfig {
    name: "subwoofer",
    input_len: 0x3eb7,
    output_len: 0x2c0,
    band_lengths: vec![0x60, 0x60, 0x100, 0xef],
    stages: vec![
        DecimationStage::new(&taps::SUB_29, true),
        DecimationStage::new(&taps::SUB_37, true),
        DecimationStage::new(&taps::SUB_93, true),
    ],
});

/// XT32 speaker: 16321 samples in, 1024 out.
pub static XT32_SPEAKER: Lazy<MultirateConfig> = Lazy::new(|| MultirateConfig {
    name: "speaker",
    input_len: 0x3fc1,
    output_len: 0x400,
    band_lengths: vec![0x100, 0x100, 0x100, 0xeb],
    stages: vec![
        DecimationStage::new(&taps::SAT_129, true),
        DecimationStage::new(&taps::SAT_129, true),
        DecimationStage::new(&taps::SAT_129, true),
    ],
});

// ============================================================================
// DSP primitives
// ============================================================================

/// Split `taps` into `m` phases; phase `p` holds `taps[p], taps[p+m], ...`.
pub fn decompose(taps: &[f64], m: usize) -> Vec<Vec<f64>> {
    (0..m)
        .map(|p| taps.iter().skip(p).step_by(m.max(1)).copied().collect())
        .collect()
}

/// Filter and downsample `signal` by `phases.len()` in one pass.
///
/// Output length is `ceil((signal.len() + tap_count - 1) / m)`, the full
/// convolution decimated.
pub fn polyphase_decimate(signal: &[f64], phases: &[Vec<f64>], tap_count: usize) -> Vec<f64> {
    let m = phases.len();
    if signal.is_empty() || tap_count == 0 || m == 0 {
        return Vec::new();
    }
    let out_len = (signal.len() + tap_count - 1).div_ceil(m);
    let n = signal.len() as isize;

    (0..out_len)
        .map(|k| {
            let mut acc = 0.0;
            for (p, phase) in phases.iter().enumerate() {
                for (i, tap) in phase.iter().enumerate() {
                    let idx = (k * m + p) as isize - (i * m) as isize;
                    if idx >= 0 && idx < n {
                        acc += tap * signal[idx as usize];
                    }
                }
            }
            acc
        })
        .collect()
}

/// Raised-cosine window, `0.5 - 0.5 cos(2 pi t)` over `t` in `[0, 1]`.
pub fn raised_cosine(len: usize) -> Vec<f64> {
    const A: f64 = 0.5;
    const B: f64 = 0.5;
    const C: f64 = 0.0;
    let factor = 1.0 / (len.max(2) - 1) as f64;
    (0..len)
        .map(|i| {
            let t = i as f64 * factor;
            A - B * (2.0 * PI * t).cos() + C * (4.0 * PI * t).cos()
        })
        .collect()
}

// ============================================================================
// Band processing
// ============================================================================

struct BandOutput {
    band: Vec<f64>,
    residual: Vec<f64>,
}

fn process_band(residual: &[f64], band_len: usize, stage: &DecimationStage, index: usize) -> BandOutput {
    if band_len == 0 {
        return BandOutput {
            band: Vec::new(),
            residual: residual.to_vec(),
        };
    }
    let delay = stage.delay();
    let Some(win_len) = band_len.checked_sub(delay) else {
        warn!("band {index}: delay {delay} exceeds band length {band_len}, band left empty");
        return BandOutput {
            band: Vec::new(),
            residual: residual.to_vec(),
        };
    };

    let win_alloc = win_len * 2 + 3;
    let window = raised_cosine(win_alloc);
    let offset = win_alloc / 2 + 1;
    let at = |i: usize| residual.get(i).copied().unwrap_or(0.0);

    let mut band = vec![0.0; band_len];
    for (i, slot) in band.iter_mut().enumerate().take(delay.min(residual.len())) {
        *slot = residual[i];
    }
    for i in 0..win_len {
        let idx = delay + i;
        if idx >= residual.len() {
            break;
        }
        if let Some(w) = window.get(offset + i) {
            band[idx] = residual[idx] * w;
        }
    }

    let mut to_decimate = Vec::with_capacity(residual.len().saturating_sub(delay));
    to_decimate.extend((0..win_len).map(|i| {
        let idx = delay + i;
        if idx < residual.len() {
            at(idx) - band[idx]
        } else {
            0.0
        }
    }));
    if delay + win_len < residual.len() {
        to_decimate.extend_from_slice(&residual[delay + win_len..]);
    }

    let scale = DECIMATION_FACTOR as f64;
    let residual = polyphase_decimate(&to_decimate, &stage.phases, stage.tap_count)
        .into_iter()
        .map(|v| v * scale)
        .collect();

    BandOutput { band, residual }
}

/// Run the full band cascade for `config`. The result always has
/// `config.output_len` samples; bands that overrun it are cut with a warning.
pub fn calculate_multirate(impulse: &[f64], config: &MultirateConfig) -> Vec<f64> {
    let mut output = vec![0.0; config.output_len];
    if impulse.is_empty() || config.band_lengths.is_empty() {
        return output;
    }
    let mut residual = impulse.to_vec();
    let mut write = 0usize;
    let last = config.band_lengths.len() - 1;

    for (index, (&band_len, stage)) in config.band_lengths[..last]
        .iter()
        .zip(&config.stages)
        .enumerate()
    {
        let processed = process_band(&residual, band_len, stage, index);
        for i in 0..band_len {
            let Some(slot) = output.get_mut(write + i) else {
                warn!("band {index} overruns output buffer of {}", config.output_len);
                break;
            };
            *slot = processed.band.get(i).copied().unwrap_or(0.0);
        }
        write += band_len;
        residual = processed.residual;
    }

    let last_len = config.band_lengths[last];
    for i in 0..last_len {
        let Some(slot) = output.get_mut(write + i) else {
            warn!("final band overruns output buffer of {}", config.output_len);
            break;
        };
        *slot = residual.get(i).copied().unwrap_or(0.0);
    }
    output
}

/// Select a layout by input length, if the length is one XT32 uses.
pub fn config_for_len(len: usize) -> Option<&'static MultirateConfig> {
    [&*XT32_SPEAKER, &*XT32_SUB]
        .into_iter()
        .find(|c| c.input_len == len)
}

/// Convert a full-rate XT32 filter to the receiver's banded layout.
///
/// Inputs whose length is not a known XT32 input length pass through
/// unchanged. A result whose length differs from the layout's output length
/// is logged and returned as is.
pub fn convert_xt32(filter: &[f64]) -> Vec<f64> {
    let Some(config) = config_for_len(filter.len()) else {
        return filter.to_vec();
    };
    debug!(
        "decimating {} {} taps to {}",
        config.name,
        filter.len(),
        config.output_len
    );
    let converted = calculate_multirate(filter, config);
    if converted.len() != config.output_len {
        warn!(
            "XT32 {} decimation produced {} samples, expected {}",
            config.name,
            converted.len(),
            config.output_len
        );
    }
    converted
}
