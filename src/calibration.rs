//! Track geometry calibration
//!
//! The averaged, dark subtracted, science frame is cut into the cross-track
//! profiles of every (spectral channel, track) pair and a Gaussian is fitted
//! to each profile. The fitted positions and widths tell the frame extraction
//! where the flux of each output lands on the detector at every wavelength.
//!
//! A fit that fails does not stop the calibration: its parameters are set to
//! zero and the failure is recorded as a [FitDiagnostic].

use std::{ops::Range, path::Path};

use itertools::iproduct;
use rayon::prelude::*;

use crate::{
    frames::{self, DarkMap, FileFailure, FrameCube, FrameLayout, FramesError, Image},
    lm::{self, LmConfig, LmError, Model},
    spectral::{Polynomial, SpectralError},
    tracks::{TrackError, TrackLayout, TrackSlices},
};

/// Gaussian coefficients file name
pub const PATTERN_COEFF: &str = "pattern_coeff.npy";
/// Position polynomials file name
pub const COEFF_POSITION_POLY: &str = "coeff_position_poly.npy";
/// Width polynomials file name
pub const COEFF_WIDTH_POLY: &str = "coeff_width_poly.npy";

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("calibration frames error")]
    Frames(#[from] FramesError),
    #[error("track layout error")]
    Tracks(#[from] TrackError),
    #[error("track polynomial fit failed")]
    Spectral(#[from] SpectralError),
    #[error("the data list is empty")]
    EmptyDataList,
    #[error("no science frame could be averaged")]
    NoFrames,
    #[error("{slices} track slices for a layout of {layout} tracks")]
    TrackMismatch { slices: usize, layout: usize },
    #[error("spectral channels {channels:?} are outside the calibration ({n_channels} channels)")]
    Channels {
        channels: Range<usize>,
        n_channels: usize,
    },
}
type Result<T> = std::result::Result<T, CalibrationError>;

/// Why a profile could not be fitted
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FitFailure {
    #[error("flat profile")]
    FlatProfile,
    #[error("fitted amplitude {0} is not positive")]
    NonPositiveAmplitude(f64),
    #[error("fitted position {position} is outside the profile [{low},{high}]")]
    OutsideProfile { position: f64, low: f64, high: f64 },
    #[error(transparent)]
    Optimizer(#[from] LmError),
}

/// Gaussian profile coefficients
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GaussianParams {
    pub amplitude: f64,
    pub position: f64,
    pub sigma: f64,
    pub offset: f64,
}
impl GaussianParams {
    /// Starting point of the fit of a track at the nominal `position`
    pub fn initial_guess(position: f64) -> Self {
        Self {
            amplitude: 100.,
            position,
            sigma: 1.,
            offset: 0.,
        }
    }
    /// `[amplitude, position, sigma, offset]`
    pub fn to_array(&self) -> [f64; 4] {
        [self.amplitude, self.position, self.sigma, self.offset]
    }
}
impl From<[f64; 4]> for GaussianParams {
    fn from([amplitude, position, sigma, offset]: [f64; 4]) -> Self {
        Self {
            amplitude,
            position,
            sigma,
            offset,
        }
    }
}

/// `A·exp(-(x-x0)²/(2σ²)) + offset`
pub fn gaussian(x: f64, params: &GaussianParams) -> f64 {
    let GaussianParams {
        amplitude,
        position,
        sigma,
        offset,
    } = *params;
    amplitude * (-(x - position).powi(2) / (2. * sigma * sigma)).exp() + offset
}

/// The Gaussian profile model
pub struct Gaussian;
impl Model<4> for Gaussian {
    fn evaluate(&self, x: f64, params: &[f64; 4]) -> f64 {
        gaussian(x, &GaussianParams::from(*params))
    }
    fn jacobian_row(&self, x: f64, params: &[f64; 4]) -> [f64; 4] {
        let [amplitude, position, sigma, _] = *params;
        let dx = x - position;
        let s2 = sigma * sigma;
        let e = (-dx * dx / (2. * s2)).exp();
        [
            e,
            amplitude * e * dx / s2,
            amplitude * e * dx * dx / (s2 * sigma),
            1.,
        ]
    }
}

/// Outcome of a profile fit
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianFit {
    /// Best-fit coefficients, the width is always positive
    pub params: GaussianParams,
    /// Variances of the coefficients
    pub variances: [f64; 4],
    /// Data minus model
    pub residuals: Vec<f64>,
}
impl GaussianFit {
    /// The result standing for a failed fit of a `n_points` profile
    pub fn zero(n_points: usize) -> Self {
        Self {
            params: GaussianParams::default(),
            variances: [0f64; 4],
            residuals: vec![0f64; n_points],
        }
    }
}

/// Least squares amplitude and offset for the position and width of `initial`
///
/// Degenerate profiles keep `initial`.
fn linear_start(axis: &[f64], profile: &[f64], initial: GaussianParams) -> GaussianParams {
    let unit = GaussianParams {
        amplitude: 1.,
        offset: 0.,
        ..initial
    };
    let shape: Vec<f64> = axis.iter().map(|&x| gaussian(x, &unit)).collect();
    let n = axis.len() as f64;
    let s: f64 = shape.iter().sum();
    let ss: f64 = shape.iter().map(|e| e * e).sum();
    let y: f64 = profile.iter().sum();
    let sy: f64 = shape.iter().zip(profile).map(|(e, y)| e * y).sum();
    let det = ss * n - s * s;
    if !(det.abs() > 1e-12 * ss * n) {
        return initial;
    }
    let amplitude = (n * sy - s * y) / det;
    let offset = (ss * y - s * sy) / det;
    if amplitude.is_finite() && offset.is_finite() {
        GaussianParams {
            amplitude,
            offset,
            ..initial
        }
    } else {
        initial
    }
}

/// Rejects fits that do not describe a bright track inside the profile
fn check_plausible(params: &GaussianParams, axis: &[f64]) -> std::result::Result<(), FitFailure> {
    if !(params.amplitude > 0.) {
        return Err(FitFailure::NonPositiveAmplitude(params.amplitude));
    }
    let low = axis.iter().copied().fold(f64::INFINITY, f64::min);
    let high = axis.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(low..=high).contains(&params.position) {
        return Err(FitFailure::OutsideProfile {
            position: params.position,
            low,
            high,
        });
    }
    Ok(())
}

/// Fits a Gaussian to the `profile` sampled at the `axis` coordinates
///
/// Only the position and the width of `initial` are used, the amplitude and
/// the offset start from their least squares values.
pub fn fit_profile(
    axis: &[f64],
    profile: &[f64],
    initial: GaussianParams,
    config: &LmConfig,
) -> std::result::Result<GaussianFit, FitFailure> {
    if profile
        .first()
        .is_some_and(|first| profile.iter().all(|x| x == first))
    {
        return Err(FitFailure::FlatProfile);
    }
    let initial = linear_start(axis, profile, initial);
    let report = lm::fit(&Gaussian, axis, profile, initial.to_array(), config)?;
    let mut params = GaussianParams::from(report.params);
    params.sigma = params.sigma.abs();
    check_plausible(&params, axis)?;
    let residuals = axis
        .iter()
        .zip(profile)
        .map(|(&x, &y)| y - gaussian(x, &params))
        .collect();
    Ok(GaussianFit {
        params,
        variances: report.variances(),
        residuals,
    })
}

/// A (spectral channel, track) pair whose fit failed
#[derive(Debug, Clone, PartialEq)]
pub struct FitDiagnostic {
    pub channel: usize,
    pub track: usize,
    pub reason: FitFailure,
}

/// Gaussian fits of every (spectral channel, track) pair
#[derive(Debug, Clone)]
pub struct Calibration {
    n_channels: usize,
    n_tracks: usize,
    fits: Vec<GaussianFit>,
    failures: Vec<FitDiagnostic>,
}
impl Calibration {
    pub fn n_channels(&self) -> usize {
        self.n_channels
    }
    pub fn n_tracks(&self) -> usize {
        self.n_tracks
    }
    pub fn fit(&self, channel: usize, track: usize) -> &GaussianFit {
        &self.fits[channel * self.n_tracks + track]
    }
    pub fn params(&self, channel: usize, track: usize) -> &GaussianParams {
        &self.fit(channel, track).params
    }
    /// The fits that failed, sorted by channel then track
    pub fn failures(&self) -> &[FitDiagnostic] {
        &self.failures
    }
    /// Coefficients table of shape (channel, track, 4)
    pub fn to_array(&self) -> Vec<f64> {
        self.fits
            .iter()
            .flat_map(|fit| fit.params.to_array())
            .collect()
    }
    /// Variances table of shape (channel, track, 4)
    pub fn variances(&self) -> Vec<f64> {
        self.fits.iter().flat_map(|fit| fit.variances).collect()
    }
    /// Saves the coefficients table into a 3-D `.npy` array
    pub fn to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        log::info!("Saving {:?}...", path);
        frames::write_array(
            path,
            &[self.n_channels, self.n_tracks, 4],
            &self.to_array(),
        )?;
        Ok(())
    }
    /// The fitted positions of a track along the spectral axis
    pub fn positions(&self, track: usize) -> Vec<f64> {
        (0..self.n_channels)
            .map(|channel| self.params(channel, track).position)
            .collect()
    }
    /// The fitted widths of a track along the spectral axis
    pub fn widths(&self, track: usize) -> Vec<f64> {
        (0..self.n_channels)
            .map(|channel| self.params(channel, track).sigma)
            .collect()
    }
    /// Mean position and width of a track over its successful fits
    ///
    /// `None` if every fit of the track failed.
    pub fn mean_geometry(&self, track: usize) -> Option<(f64, f64)> {
        let (n, position, width) = (0..self.n_channels)
            .filter(|&channel| !self.is_failure(channel, track))
            .map(|channel| self.params(channel, track))
            .fold((0usize, 0f64, 0f64), |(n, position, width), p| {
                (n + 1, position + p.position, width + p.sigma)
            });
        (n > 0).then(|| (position / n as f64, width / n as f64))
    }
    fn is_failure(&self, channel: usize, track: usize) -> bool {
        self.failures
            .iter()
            .any(|f| f.channel == channel && f.track == track)
    }
    fn track_polynomials<F>(
        &self,
        channels: Range<usize>,
        degree: usize,
        value: F,
    ) -> Result<Vec<Polynomial>>
    where
        F: Fn(&GaussianParams) -> f64,
    {
        if channels.end > self.n_channels || channels.is_empty() {
            return Err(CalibrationError::Channels {
                channels,
                n_channels: self.n_channels,
            });
        }
        let x: Vec<f64> = channels.clone().map(|c| c as f64).collect();
        (0..self.n_tracks)
            .map(|track| {
                let y: Vec<f64> = channels
                    .clone()
                    .map(|channel| value(self.params(channel, track)))
                    .collect();
                let weights: Vec<f64> = channels
                    .clone()
                    .map(|channel| {
                        if self.is_failure(channel, track) {
                            0.
                        } else {
                            1.
                        }
                    })
                    .collect();
                Ok(Polynomial::fit(&x, &y, degree, Some(&weights))?)
            })
            .collect()
    }
    /// Polynomial fits of the track positions against the spectral channel
    ///
    /// Failed fits are given a zero weight.
    pub fn position_polynomials(
        &self,
        channels: Range<usize>,
        degree: usize,
    ) -> Result<Vec<Polynomial>> {
        self.track_polynomials(channels, degree, |p| p.position)
    }
    /// Polynomial fits of the track widths against the spectral channel
    ///
    /// Failed fits are given a zero weight.
    pub fn width_polynomials(&self, channels: Range<usize>, degree: usize) -> Result<Vec<Polynomial>> {
        self.track_polynomials(channels, degree, |p| p.sigma)
    }
}

/// Fits every (spectral channel, track) profile in parallel
///
/// The fit of a track starts at its nominal position in the `layout`.
pub fn calibrate(slices: &TrackSlices, layout: &TrackLayout, config: &LmConfig) -> Result<Calibration> {
    if slices.n_tracks() != layout.n_tracks() {
        return Err(CalibrationError::TrackMismatch {
            slices: slices.n_tracks(),
            layout: layout.n_tracks(),
        });
    }
    let (n_channels, n_tracks) = (slices.n_channels(), slices.n_tracks());
    log::info!("Fitting {} track profiles...", n_channels * n_tracks);
    let outcomes: Vec<_> = iproduct!(0..n_channels, 0..n_tracks)
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(channel, track)| {
            let axis = slices.axis(track);
            let initial = GaussianParams::initial_guess(layout.position(track));
            match fit_profile(axis, slices.profile(channel, track), initial, config) {
                Ok(fit) => (fit, None),
                Err(reason) => {
                    log::warn!(
                        "Error fit at spectral channel {} of track {}: {}",
                        channel,
                        track,
                        reason
                    );
                    let diagnostic = FitDiagnostic {
                        channel,
                        track,
                        reason,
                    };
                    (GaussianFit::zero(axis.len()), Some(diagnostic))
                }
            }
        })
        .collect();
    let mut fits = Vec::with_capacity(outcomes.len());
    let mut failures = vec![];
    for (fit, failure) in outcomes {
        fits.push(fit);
        failures.extend(failure);
    }
    log::info!("... {} fits failed", failures.len());
    Ok(Calibration {
        n_channels,
        n_tracks,
        fits,
        failures,
    })
}

/// Sum of dark subtracted frames
#[derive(Debug, Clone)]
struct FrameSum {
    sum: Image,
    n_frames: usize,
    failures: Vec<FileFailure>,
}
impl FrameSum {
    fn new(shape: (usize, usize)) -> Self {
        Self {
            sum: Image::zeros(shape.0, shape.1),
            n_frames: 0,
            failures: vec![],
        }
    }
    fn add_file(mut self, path: &Path, dark: &DarkMap, layout: FrameLayout) -> Self {
        let added = FrameCube::from_path(path, layout).and_then(|mut cube| {
            cube.subtract_dark(dark)?;
            self.sum.accumulate(&cube.sum_frames())?;
            self.n_frames += cube.n_frames();
            Ok(())
        });
        if let Err(e) = added {
            let failure = FileFailure::from_error(path, &e);
            log::warn!("Skipping {:?}: {}", path, failure.reason);
            self.failures.push(failure);
        }
        self
    }
    fn merge(mut self, other: Self) -> std::result::Result<Self, FramesError> {
        self.sum.accumulate(&other.sum)?;
        self.n_frames += other.n_frames;
        self.failures.extend(other.failures);
        Ok(self)
    }
}

/// The average of the dark subtracted science frames
#[derive(Debug, Clone)]
pub struct ScienceAverage {
    pub image: Image,
    pub n_frames: usize,
    pub failures: Vec<FileFailure>,
}

/// Averages the dark subtracted frames of the science files in parallel
///
/// Unreadable files are skipped; it is an error if no frame at all is averaged.
pub fn average_frames<I>(paths: I, dark: &DarkMap, layout: FrameLayout) -> Result<ScienceAverage>
where
    I: ParallelIterator,
    I::Item: AsRef<Path>,
{
    let FrameSum {
        sum,
        n_frames,
        failures,
    } = paths
        .fold(
            || FrameSum::new(dark.shape()),
            |acc, path| acc.add_file(path.as_ref(), dark, layout),
        )
        .map(Ok::<_, FramesError>)
        .try_reduce(|| FrameSum::new(dark.shape()), FrameSum::merge)?;
    let image = sum.divided_by(n_frames).ok_or(CalibrationError::NoFrames)?;
    Ok(ScienceAverage {
        image,
        n_frames,
        failures,
    })
}

/// Averages the dark subtracted frames of a list of science files
pub fn average_science_frames<P>(paths: &[P], dark: &DarkMap, layout: FrameLayout) -> Result<ScienceAverage>
where
    P: AsRef<Path> + Sync,
{
    if paths.is_empty() {
        return Err(CalibrationError::EmptyDataList);
    }
    log::info!("Averaging the frames of {} files...", paths.len());
    average_frames(paths.par_iter(), dark, layout)
}
