use crate::{
    calibration::CalibrationError, dark::DarkError, explorer::ExplorerError, frames::FramesError,
    histogram::HistogramError, lm::LmError, null_depth::NullDepthError, spectral::SpectralError,
    tracks::TrackError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error in the `frames` module")]
    Frames(#[from] FramesError),
    #[error("Error in the `histogram` module")]
    Histogram(#[from] HistogramError),
    #[error("Error in the `dark` module")]
    Dark(#[from] DarkError),
    #[error("Error in the `tracks` module")]
    Tracks(#[from] TrackError),
    #[error("Error in the `lm` module")]
    Lm(#[from] LmError),
    #[error("Error in the `calibration` module")]
    Calibration(#[from] CalibrationError),
    #[error("Error in the `spectral` module")]
    Spectral(#[from] SpectralError),
    #[error("Error in the `null_depth` module")]
    NullDepth(#[from] NullDepthError),
    #[error("Error in the `explorer` module")]
    Explorer(#[from] ExplorerError),
}
