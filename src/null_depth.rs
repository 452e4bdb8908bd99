//! Null depth of a pair of interfering beams
//!
//! ```text
//! I- = I1 + I2 - 2·sqrt(I1·I2)·V·cos(φ) + dark_null
//! I+ = I1 + I2 + 2·sqrt(I1·I2)·V·cos(φ) + dark_antinull
//! null = I- / I+
//! ```
//!
//! The intensities are expected to be non-negative, a negative product
//! `I1·I2` yields a NaN null depth.

use std::ops::Range;

use rand::Rng;

use crate::histogram::{Histogram, HistogramError, InverseCdfSampler};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum NullDepthError {
    #[error("the antinull intensity vanishes ({0:e})")]
    VanishingAntinull(f64),
    #[error("null depth histogram error")]
    Histogram(#[from] HistogramError),
    #[error("every simulated sample hit a vanishing antinull")]
    NoSample,
}
type Result<T> = std::result::Result<T, NullDepthError>;

/// Inputs of the null depth of one sample
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NullDepthSample {
    /// First beam intensity
    pub i1: f64,
    /// Second beam intensity
    pub i2: f64,
    /// Phase difference [rd]
    pub phase: f64,
    pub visibility: f64,
    /// Dark current in the null output
    pub dark_null: f64,
    /// Dark current in the antinull output
    pub dark_antinull: f64,
}
impl NullDepthSample {
    /// The null and antinull intensities
    pub fn intensities(&self) -> (f64, f64) {
        let photometry = self.i1 + self.i2;
        let fringe = 2. * (self.i1 * self.i2).sqrt() * self.visibility * self.phase.cos();
        (
            photometry - fringe + self.dark_null,
            photometry + fringe + self.dark_antinull,
        )
    }
    /// The null depth `I-/I+`
    pub fn null_depth(&self) -> Result<f64> {
        let (i_minus, i_plus) = self.intensities();
        let scale = (self.i1 + self.i2).abs() + self.dark_antinull.abs();
        if i_plus == 0. || i_plus.abs() <= 4. * f64::EPSILON * scale {
            return Err(NullDepthError::VanishingAntinull(i_plus));
        }
        Ok(i_minus / i_plus)
    }
}

/// The null depth of two beams of intensities `i1` and `i2`
pub fn null_depth(
    i1: f64,
    i2: f64,
    phase: f64,
    visibility: f64,
    dark_null: f64,
    dark_antinull: f64,
) -> Result<f64> {
    NullDepthSample {
        i1,
        i2,
        phase,
        visibility,
        dark_null,
        dark_antinull,
    }
    .null_depth()
}

/// The null depth of every sample
pub fn null_depths(samples: &[NullDepthSample]) -> Vec<Result<f64>> {
    samples.iter().map(NullDepthSample::null_depth).collect()
}

/// Histogram of the null depths of the samples with a defined null depth
pub fn null_depth_histogram(samples: &[NullDepthSample], n_bins: usize) -> Result<Histogram> {
    let values: Vec<f64> = samples
        .iter()
        .filter_map(|sample| sample.null_depth().ok())
        .collect();
    Ok(Histogram::from_samples(&values, n_bins)?)
}

/// Phase distribution of a [NullDepthSimulation]
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseModel {
    Constant(f64),
    /// Uniformly distributed over the range
    Uniform(Range<f64>),
}

/// Monte Carlo model of the null depth distribution
///
/// The beam intensities and the dark currents are drawn from their measured
/// histograms.
#[derive(Debug, Clone)]
pub struct NullDepthSimulation {
    pub photometry_1: InverseCdfSampler,
    pub photometry_2: InverseCdfSampler,
    pub dark_null: InverseCdfSampler,
    pub dark_antinull: InverseCdfSampler,
    pub visibility: f64,
    pub phase: PhaseModel,
}
impl NullDepthSimulation {
    /// Draws `n` samples
    pub fn samples<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<NullDepthSample> {
        (0..n)
            .map(|_| NullDepthSample {
                i1: self.photometry_1.sample(rng),
                i2: self.photometry_2.sample(rng),
                phase: match &self.phase {
                    PhaseModel::Constant(phase) => *phase,
                    PhaseModel::Uniform(range) if range.start < range.end => {
                        rng.gen_range(range.clone())
                    }
                    PhaseModel::Uniform(range) => range.start,
                },
                visibility: self.visibility,
                dark_null: self.dark_null.sample(rng),
                dark_antinull: self.dark_antinull.sample(rng),
            })
            .collect()
    }
    /// Histogram of `n` simulated null depths
    ///
    /// Samples with a vanishing antinull are dropped.
    pub fn histogram<R: Rng + ?Sized>(&self, rng: &mut R, n: usize, n_bins: usize) -> Result<Histogram> {
        let samples = self.samples(rng, n);
        let histogram = null_depth_histogram(&samples, n_bins)?;
        if n > 0 && histogram.total() == 0 {
            return Err(NullDepthError::NoSample);
        }
        Ok(histogram)
    }
}
