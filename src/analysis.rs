//! Sliding-window band-power estimation.
//!
//! For every band and every channel with live data:
//!
//! 1. subtract the mean (DC removal)
//! 2. apply a Hamming window
//! 3. FFT, keep the one-sided half, scale magnitudes by `2/N`
//! 4. average the magnitudes of bins with `low ≤ f < high`
//!
//! The band's value is the mean over contributing channels.  A channel whose
//! peak absolute value is below [`NOISE_FLOOR_UV`] is treated as not yet
//! streaming and skipped; a band with no contributing channel is omitted.

use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use thiserror::Error;

use crate::buffer::ChannelBuffers;
use crate::protocol::EEG_FREQUENCY;
use crate::types::{Band, BandPowers, Channel, BANDS};

/// Peak amplitude (µV) below which a window counts as "no data yet".
///
/// A heuristic: a genuinely flat channel is indistinguishable from one that
/// has not started streaming.
pub const NOISE_FLOOR_UV: f64 = 0.1;

#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("snapshot for {channel} has {got} samples, expected {expected}")]
    WindowMismatch { channel: Channel, got: usize, expected: usize },
    #[error("non-finite {band} power on {channel}")]
    NonFinite { band: &'static str, channel: Channel },
}

/// Reusable FFT plan, window, and frequency axis for one window length.
pub struct BandPowerAnalyzer {
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    /// Centre frequency of each one-sided bin.
    freqs: Vec<f64>,
}

impl BandPowerAnalyzer {
    /// Analyzer for windows of `len` samples at `sample_rate` Hz.
    pub fn new(len: usize, sample_rate: f64) -> Self {
        let fft = FftPlanner::<f64>::new().plan_fft_forward(len);
        let freqs = (0..len / 2).map(|k| k as f64 * sample_rate / len as f64).collect();
        Self { fft, window: hamming(len), freqs }
    }

    /// Analyzer matching the given buffers at the device sample rate.
    pub fn for_buffers(buffers: &ChannelBuffers) -> Self {
        Self::new(buffers.capacity(), EEG_FREQUENCY)
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Band powers over the current contents of `buffers`.
    pub fn compute(&self, buffers: &ChannelBuffers) -> Result<BandPowers, AnalysisError> {
        let mut spectra = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let snapshot = buffers.snapshot(channel);
            if snapshot.len() != self.window.len() {
                return Err(AnalysisError::WindowMismatch {
                    channel,
                    got: snapshot.len(),
                    expected: self.window.len(),
                });
            }
            if is_live(&snapshot) {
                spectra.push((channel, self.spectrum(&snapshot)));
            }
        }

        let mut powers = BandPowers::new();
        for band in &BANDS {
            let mut per_channel = Vec::with_capacity(spectra.len());
            for (channel, spectrum) in &spectra {
                if let Some(power) = self.band_power(spectrum, band) {
                    if !power.is_finite() {
                        return Err(AnalysisError::NonFinite { band: band.name, channel: *channel });
                    }
                    per_channel.push(power);
                }
            }
            if !per_channel.is_empty() {
                powers.insert(band.name, mean(&per_channel));
            }
        }
        Ok(powers)
    }

    /// One-sided magnitude spectrum, normalised by `2/N`.
    pub fn spectrum(&self, samples: &[f64]) -> Vec<f64> {
        let n = samples.len();
        let dc = mean(samples);
        let mut buf: Vec<Complex64> = samples
            .iter()
            .zip(&self.window)
            .map(|(&x, &w)| Complex64::new((x - dc) * w, 0.0))
            .collect();
        self.fft.process(&mut buf);
        buf.iter().take(n / 2).map(|c| 2.0 * c.norm() / n as f64).collect()
    }

    /// Mean magnitude of the bins inside `band`, or `None` if no bin falls in it.
    fn band_power(&self, spectrum: &[f64], band: &Band) -> Option<f64> {
        let selected: Vec<f64> = self
            .freqs
            .iter()
            .zip(spectrum)
            .filter(|(f, _)| band.contains(**f))
            .map(|(_, &m)| m)
            .collect();
        (!selected.is_empty()).then(|| mean(&selected))
    }
}

fn is_live(samples: &[f64]) -> bool {
    samples.iter().fold(0.0_f64, |peak, &v| peak.max(v.abs())) >= NOISE_FLOOR_UV
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Symmetric Hamming window: `0.54 − 0.46·cos(2πn / (N−1))`.
fn hamming(len: usize) -> Vec<f64> {
    if len == 1 {
        return vec![1.0];
    }
    let denom = (len - 1) as f64;
    (0..len)
        .map(|n| 0.54 - 0.46 * (2.0 * PI * n as f64 / denom).cos())
        .collect()
}
