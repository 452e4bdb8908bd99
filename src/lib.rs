//! GLINT data reduction
//!
//! Reduction of the frames of the GLINT nulling interferometer:
//!  - [dark]: average dark map and dark current histogram,
//!  - [calibration]: position and width of the 16 outputs on the detector,
//!  - [null_depth]: null depth model,
//!  - [explorer]: quick look at the science frames.

use std::path::Path;

pub mod calibration;
pub mod dark;
mod error;
pub mod explorer;
pub mod frames;
pub mod histogram;
pub mod lm;
pub mod null_depth;
pub mod spectral;
pub mod tracks;

pub use calibration::{calibrate, fit_profile, Calibration, FitDiagnostic, GaussianFit, GaussianParams};
pub use dark::{aggregate_darks, AcquisitionDate, DarkConfig, DarkHistogramRecord, DarkReduction};
pub use error::Error;
pub use explorer::{Explorer, Output};
pub use frames::{DarkMap, FileFailure, FrameCube, FrameLayout, Image};
pub use histogram::{BinGrid, Histogram, InverseCdfSampler};
pub use null_depth::{null_depth, NullDepthSample};
pub use tracks::{TrackLayout, TrackSlices};

pub type Result<T> = std::result::Result<T, Error>;

/// Averages the dark subtracted science frames and fits the tracks of the average
pub fn calibrate_tracks<P>(
    paths: &[P],
    dark: &DarkMap,
    frame_layout: FrameLayout,
    tracks: &TrackLayout,
    config: &lm::LmConfig,
) -> Result<(calibration::ScienceAverage, Calibration)>
where
    P: AsRef<Path> + Sync,
{
    let average = calibration::average_science_frames(paths, dark, frame_layout)?;
    let slices = tracks.slices(&average.image)?;
    let calibration = calibrate(&slices, tracks, config)?;
    Ok((average, calibration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_of_synthetic_frames() {
        let dir = std::env::temp_dir().join("glint-drs_calibrate_tracks");
        std::fs::create_dir_all(&dir).unwrap();
        let (n_spatial, n_spectral) = (40, 4);
        let tracks = TrackLayout::from_ends(10., 25., 2).unwrap();
        let frame: Vec<f64> = (0..n_spatial)
            .flat_map(|row| {
                let x = row as f64;
                let value = [10.2, 24.7]
                    .iter()
                    .map(|pos| 100. * (-0.5 * ((x - pos) / 1.5f64).powi(2)).exp())
                    .sum::<f64>()
                    + 5.;
                vec![value; n_spectral]
            })
            .collect();
        let path = dir.join("science.npy");
        let data: Vec<f64> = frame.iter().chain(frame.iter()).copied().collect();
        frames::write_array(&path, &[2, n_spatial, n_spectral], &data).unwrap();

        let dark = DarkMap::zeros(n_spatial, n_spectral);
        let (average, calibration) = calibrate_tracks(
            &[&path],
            &dark,
            FrameLayout::Natural,
            &tracks,
            &lm::LmConfig::default(),
        )
        .unwrap();
        assert_eq!(average.n_frames, 2);
        assert!(calibration.failures().is_empty());
        for (track, pos) in [10.2, 24.7].into_iter().enumerate() {
            for channel in 0..n_spectral {
                let params = calibration.params(channel, track);
                assert!((params.position - pos).abs() < 1e-3);
                assert!((params.sigma - 1.5).abs() < 1e-3);
            }
        }

        let missing: [&Path; 0] = [];
        assert!(matches!(
            calibrate_tracks(&missing, &dark, FrameLayout::Natural, &tracks, &lm::LmConfig::default()),
            Err(Error::Calibration(calibration::CalibrationError::EmptyDataList))
        ));
    }
}
