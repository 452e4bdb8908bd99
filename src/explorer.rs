//! Quick look at the science frames
//!
//! The frames of a set of files are dark subtracted and stacked, then the
//! spectra of the 16 outputs are read at the nominal row of each output.

use std::{fmt, ops::Range, path::Path, str::FromStr};

use rayon::prelude::*;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::{
    dark::DarkConfig,
    frames::{DarkMap, FileFailure, FrameCube, FrameLayout, FramesError},
    histogram::{BinGrid, Histogram, HistogramError},
    spectral::{SpectralError, WavelengthCalibration},
};

#[derive(thiserror::Error, Debug)]
pub enum ExplorerError {
    #[error("explorer frames error")]
    Frames(#[from] FramesError),
    #[error("no frame could be loaded")]
    NoData,
    #[error("no dark file to build a dark from")]
    NoDark,
    #[error("{0} track rows, expected 16")]
    Positions(usize),
    #[error("row {row} is outside the detector ({n_spatial} rows)")]
    OutOfDetector { row: usize, n_spatial: usize },
    #[error("spectral channels {channels:?} are outside the detector ({n_spectral} channels)")]
    Channels {
        channels: Range<usize>,
        n_spectral: usize,
    },
    #[error(r#"output {0} is not recognized, expected P1-P4, N1-N6 or AN1-AN6"#)]
    Output(String),
    #[error("wavelength calibration error")]
    Spectral(#[from] SpectralError),
    #[error("null ratio histogram error")]
    Histogram(#[from] HistogramError),
    #[error("failed to write the band fluxes")]
    Csv(#[from] csv::Error),
}
type Result<T> = std::result::Result<T, ExplorerError>;

/// Nominal detector rows of the 16 tracks
pub const EXPLORER_POSITIONS: [usize; 16] = [
    33, 53, 72, 92, 111, 131, 151, 170, 190, 210, 229, 249, 269, 288, 308, 328,
];
/// Spectral band of the flux time series
pub const DEFAULT_BAND: Range<usize> = 45..57;
/// Camera frame rate [Hz]
pub const DEFAULT_FPS: f64 = 1400.;
/// Bounds of the null ratio histograms
pub const NULL_RATIO_RANGE: (f64, f64) = (-1., 3.);

/// GLINT outputs: photometric (P), null (N) and antinull (AN)
///
/// The iteration order pairs each null with its antinull.
#[derive(EnumIter, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Output {
    P1,
    P2,
    P3,
    P4,
    N1,
    AN1,
    N2,
    AN2,
    N3,
    AN3,
    N4,
    AN4,
    N5,
    AN5,
    N6,
    AN6,
}
impl Output {
    /// Index of the detector track the output lands on
    pub fn track(&self) -> usize {
        use Output::*;
        match self {
            P1 => 15,
            P2 => 13,
            P3 => 2,
            P4 => 0,
            N1 => 11,
            N2 => 3,
            N3 => 1,
            N4 => 6,
            N5 => 5,
            N6 => 8,
            AN1 => 9,
            AN2 => 12,
            AN3 => 14,
            AN4 => 4,
            AN5 => 7,
            AN6 => 10,
        }
    }
    /// The beams interfering in a null or an antinull output
    pub fn baseline(&self) -> Option<(u8, u8)> {
        use Output::*;
        match self {
            N1 | AN1 => Some((1, 2)),
            N2 | AN2 => Some((2, 3)),
            N3 | AN3 => Some((1, 4)),
            N4 | AN4 => Some((3, 4)),
            N5 | AN5 => Some((1, 3)),
            N6 | AN6 => Some((2, 4)),
            P1 | P2 | P3 | P4 => None,
        }
    }
    /// The antinull output of a null output
    pub fn antinull(&self) -> Option<Output> {
        use Output::*;
        match self {
            N1 => Some(AN1),
            N2 => Some(AN2),
            N3 => Some(AN3),
            N4 => Some(AN4),
            N5 => Some(AN5),
            N6 => Some(AN6),
            _ => None,
        }
    }
    /// The null outputs
    pub fn nulls() -> impl Iterator<Item = Output> {
        Output::iter().filter(|output| output.antinull().is_some())
    }
}
impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
impl FromStr for Output {
    type Err = ExplorerError;

    fn from_str(s: &str) -> Result<Self> {
        Output::iter()
            .find(|output| output.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| ExplorerError::Output(s.to_string()))
    }
}

/// The dark map, or the mean frame of the first readable dark file if the map is missing
pub fn dark_or_fallback<P, Q>(dark_path: P, dark_files: &[Q], config: &DarkConfig) -> Result<DarkMap>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let dark_path = dark_path.as_ref();
    if dark_path.exists() {
        log::info!("Loading {:?}...", dark_path);
        return Ok(DarkMap::from_path(dark_path)?);
    }
    log::warn!("No dark found at {:?}, creating a new one", dark_path);
    for path in dark_files {
        let path = path.as_ref();
        match FrameCube::from_path(path, config.layout).map(|cube| cube.mean_frame()) {
            Ok(Some(dark)) => return Ok(dark),
            Ok(None) => log::warn!("Skipping {:?}: no frame", path),
            Err(e) => log::warn!("Skipping {:?}: {}", path, e),
        }
    }
    Err(ExplorerError::NoDark)
}

/// Dark subtracted frame stack
#[derive(Debug, Clone)]
pub struct Explorer {
    stack: FrameCube,
    positions: [usize; 16],
    fps: f64,
    failures: Vec<FileFailure>,
}
impl Explorer {
    /// Loads and stacks the frames of the files in order
    ///
    /// Files without frames are skipped and recorded as failures.
    pub fn load<P>(paths: &[P], dark: &DarkMap, layout: FrameLayout) -> Result<Self>
    where
        P: AsRef<Path> + Sync,
    {
        log::info!("Loading {} files...", paths.len());
        let now = std::time::Instant::now();
        let loaded: Vec<_> = paths
            .par_iter()
            .map(|path| {
                let path = path.as_ref();
                FrameCube::from_path(path, layout)
                    .and_then(|mut cube| {
                        cube.subtract_dark(dark)?;
                        Ok(cube)
                    })
                    .map_err(|e| FileFailure::from_error(path, &e))
            })
            .collect();
        let mut cubes = vec![];
        let mut failures = vec![];
        for outcome in loaded {
            match outcome {
                Ok(cube) => cubes.push(cube),
                Err(failure) => {
                    log::warn!("Skipping {:?}: {}", failure.path, failure.reason);
                    failures.push(failure)
                }
            }
        }
        if cubes.is_empty() {
            return Err(ExplorerError::NoData);
        }
        let stack = FrameCube::concat(cubes)?;
        log::info!(
            "... {} frames loaded in {}ms",
            stack.n_frames(),
            now.elapsed().as_millis()
        );
        Self::new(stack, EXPLORER_POSITIONS).map(|explorer| Self {
            failures,
            ..explorer
        })
    }
    /// Creates an explorer from a frame stack and the rows of the 16 tracks
    pub fn new(stack: FrameCube, positions: [usize; 16]) -> Result<Self> {
        let (n_spatial, _) = stack.frame_shape();
        if let Some(&row) = positions.iter().find(|&&row| row >= n_spatial) {
            return Err(ExplorerError::OutOfDetector { row, n_spatial });
        }
        Ok(Self {
            stack,
            positions,
            fps: DEFAULT_FPS,
            failures: vec![],
        })
    }
    /// Replaces the rows of the 16 tracks
    pub fn with_positions(self, positions: &[usize]) -> Result<Self> {
        let positions: [usize; 16] = positions
            .try_into()
            .map_err(|_| ExplorerError::Positions(positions.len()))?;
        Self::new(self.stack, positions).map(|explorer| Self {
            failures: self.failures,
            fps: self.fps,
            ..explorer
        })
    }
    /// Sets the camera frame rate
    pub fn fps(self, fps: f64) -> Self {
        Self { fps, ..self }
    }
    /// Bins `n` consecutive frames together
    pub fn binned(self, n: Option<usize>, average: bool) -> Self {
        Self {
            stack: self.stack.binning(n, average),
            ..self
        }
    }
    pub fn n_frames(&self) -> usize {
        self.stack.n_frames()
    }
    pub fn n_spectral(&self) -> usize {
        self.stack.frame_shape().1
    }
    pub fn stack(&self) -> &FrameCube {
        &self.stack
    }
    pub fn failures(&self) -> &[FileFailure] {
        &self.failures
    }
    /// Time stamp of each frame [s]
    pub fn times(&self) -> Vec<f64> {
        (1..=self.n_frames()).map(|k| k as f64 / self.fps).collect()
    }
    /// The spectrum of an output in a frame
    pub fn output_spectrum(&self, frame: usize, output: Output) -> &[f64] {
        self.stack
            .spectrum(frame, self.positions[output.track()])
    }
    /// The spectra of the 16 outputs in a frame
    pub fn output_spectra(&self, frame: usize) -> Vec<(Output, &[f64])> {
        Output::iter()
            .map(|output| (output, self.output_spectrum(frame, output)))
            .collect()
    }
    fn check_band(&self, channels: &Range<usize>) -> Result<()> {
        if channels.is_empty() || channels.end > self.n_spectral() {
            return Err(ExplorerError::Channels {
                channels: channels.clone(),
                n_spectral: self.n_spectral(),
            });
        }
        Ok(())
    }
    /// The mean flux of an output over a spectral band, frame by frame
    pub fn band_flux(&self, output: Output, channels: Range<usize>) -> Result<Vec<f64>> {
        self.check_band(&channels)?;
        let n = channels.len() as f64;
        Ok((0..self.n_frames())
            .map(|k| self.output_spectrum(k, output)[channels.clone()].iter().sum::<f64>() / n)
            .collect())
    }
    /// The null to antinull band flux ratio, frame by frame
    ///
    /// `None` for a photometric output or where the antinull flux is zero.
    pub fn null_ratio(&self, null: Output, channels: Range<usize>) -> Result<Option<Vec<Option<f64>>>> {
        let Some(antinull) = null.antinull() else {
            return Ok(None);
        };
        let nulls = self.band_flux(null, channels.clone())?;
        let antinulls = self.band_flux(antinull, channels)?;
        Ok(Some(
            nulls
                .into_iter()
                .zip(antinulls)
                .map(|(n, an)| (an != 0.).then(|| n / an))
                .collect(),
        ))
    }
    /// Histogram of the null ratio over [NULL_RATIO_RANGE] with `floor(sqrt(n))` bins
    ///
    /// `None` if `null` is not a null output.
    pub fn null_ratio_histogram(&self, null: Output, channels: Range<usize>) -> Result<Option<Histogram>> {
        let Some(ratio) = self.null_ratio(null, channels)? else {
            return Ok(None);
        };
        let ratio: Vec<f64> = ratio.into_iter().flatten().collect();
        let n_bins = ((ratio.len() as f64).sqrt() as usize).max(1);
        let (low, high) = NULL_RATIO_RANGE;
        let mut histogram = Histogram::new(BinGrid::new(low, high, n_bins)?);
        histogram.fill_iter(ratio);
        Ok(Some(histogram))
    }
    /// The wavelengths of each output
    ///
    /// Without calibration the wavelengths are the pixel indices.
    pub fn wavelengths(&self, calibration: Option<&WavelengthCalibration>) -> Result<Vec<(Output, Vec<f64>)>> {
        let n_spectral = self.n_spectral();
        Output::iter()
            .map(|output| {
                let scale = match calibration {
                    Some(calibration) => calibration.scale(output.track(), n_spectral)?,
                    None => (0..n_spectral).map(|k| k as f64).collect(),
                };
                Ok((output, scale))
            })
            .collect()
    }
    /// Writes the band flux of every output, frame by frame, into a CSV file
    pub fn to_csv<P: AsRef<Path>>(&self, path: P, channels: Range<usize>) -> Result<()> {
        let fluxes = Output::iter()
            .map(|output| self.band_flux(output, channels.clone()))
            .collect::<Result<Vec<_>>>()?;
        let mut wtr = csv::Writer::from_path(path)?;
        let mut keys = vec![String::from("Frame"), String::from("Time [s]")];
        keys.extend(Output::iter().map(|output| format!("{} flux [ADU]", output)));
        wtr.write_record(&keys)?;
        for (k, t) in self.times().into_iter().enumerate() {
            let mut record = vec![format!("{}", k), format!("{}", t)];
            record.extend(fluxes.iter().map(|flux| format!("{}", flux[k])));
            wtr.write_record(&record)?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn outputs_cover_every_track() {
        let tracks: HashSet<usize> = Output::iter().map(|o| o.track()).collect();
        assert_eq!(tracks.len(), 16);
        let order: Vec<String> = Output::iter().map(|o| o.to_string()).collect();
        assert_eq!(order[..6], ["P1", "P2", "P3", "P4", "N1", "AN1"]);
        assert_eq!(Output::nulls().count(), 6);
        assert_eq!("an3".parse::<Output>().unwrap(), Output::AN3);
        assert!("N7".parse::<Output>().is_err());
        assert_eq!(Output::N5.baseline(), Some((1, 3)));
    }

    fn explorer() -> Explorer {
        // every pixel is frame + row/1000 + channel/1e6
        let (n_frames, n_spatial, n_spectral) = (3, 344, 96);
        let data = (0..n_frames)
            .flat_map(|k| {
                (0..n_spatial).flat_map(move |r| {
                    (0..n_spectral).map(move |c| k as f64 + r as f64 * 1e-3 + c as f64 * 1e-6)
                })
            })
            .collect();
        let stack = FrameCube::new(n_frames, n_spatial, n_spectral, data).unwrap();
        Explorer::new(stack, EXPLORER_POSITIONS).unwrap()
    }

    #[test]
    fn spectra_are_read_at_the_track_rows() {
        let explorer = explorer();
        let spectrum = explorer.output_spectrum(2, Output::P1);
        assert_eq!(spectrum.len(), 96);
        assert!((spectrum[0] - (2. + 0.328)).abs() < 1e-12);
        let spectra = explorer.output_spectra(0);
        assert_eq!(spectra.len(), 16);
        assert_eq!(spectra[3].0, Output::P4);
        assert!((spectra[3].1[0] - 0.033).abs() < 1e-12);
    }

    #[test]
    fn band_flux_and_null_ratio() {
        let explorer = explorer();
        let flux = explorer.band_flux(Output::N1, DEFAULT_BAND).unwrap();
        assert_eq!(flux.len(), 3);
        // row 249, mean channel 50.5
        assert!((flux[1] - (1. + 0.249 + 50.5e-6)).abs() < 1e-12);
        assert!(explorer.null_ratio(Output::P2, DEFAULT_BAND).unwrap().is_none());
        let ratio = explorer.null_ratio(Output::N1, DEFAULT_BAND).unwrap().unwrap();
        let an1 = explorer.band_flux(Output::AN1, DEFAULT_BAND).unwrap();
        assert_eq!(ratio[1], Some(flux[1] / an1[1]));
        assert!(matches!(
            explorer.band_flux(Output::N1, 90..97),
            Err(ExplorerError::Channels { .. })
        ));
    }

    #[test]
    fn null_ratio_histogram_has_fixed_bounds() {
        let explorer = explorer();
        assert!(explorer
            .null_ratio_histogram(Output::AN1, DEFAULT_BAND)
            .unwrap()
            .is_none());
        let histogram = explorer
            .null_ratio_histogram(Output::N1, DEFAULT_BAND)
            .unwrap()
            .unwrap();
        assert_eq!(histogram.grid().low(), -1.);
        assert_eq!(histogram.grid().high(), 3.);
        assert_eq!(histogram.grid().n_bins(), 1);
        assert_eq!(histogram.total(), 3);

        let stack = explorer.stack().clone();
        let stacked = FrameCube::concat(vec![stack.clone(), stack.clone(), stack]).unwrap();
        let histogram = Explorer::new(stacked, EXPLORER_POSITIONS)
            .unwrap()
            .null_ratio_histogram(Output::N1, DEFAULT_BAND)
            .unwrap()
            .unwrap();
        // 9 frames in 3 bins of width 4/3, every ratio is in [1,1.2]
        assert_eq!(histogram.grid().n_bins(), 3);
        assert_eq!(histogram.counts(), &[0, 9, 0]);
    }

    #[test]
    fn positions_are_validated() {
        let explorer = explorer();
        assert!(matches!(
            explorer.clone().with_positions(&[1, 2, 3]),
            Err(ExplorerError::Positions(3))
        ));
        let mut positions = EXPLORER_POSITIONS;
        positions[15] = 344;
        assert!(matches!(
            explorer.with_positions(&positions),
            Err(ExplorerError::OutOfDetector { row: 344, .. })
        ));
    }

    #[test]
    fn wavelengths_fall_back_to_pixels() {
        let explorer = explorer();
        let wavelengths = explorer.wavelengths(None).unwrap();
        assert_eq!(wavelengths[0].1[95], 95.);
        let explorer = explorer.binned(Some(2), true);
        assert_eq!(explorer.n_frames(), 1);
        assert_eq!(explorer.times(), vec![1. / DEFAULT_FPS]);
    }

    #[test]
    fn loading_and_csv() {
        let dir = std::env::temp_dir().join("glint-drs_explorer");
        std::fs::create_dir_all(&dir).unwrap();
        let explorer = explorer();
        let (n_frames, n_spatial, n_spectral) = explorer.stack().shape();
        let data: Vec<f64> = explorer.stack().frames().flatten().copied().collect();
        let path = dir.join("data.npy");
        crate::frames::write_array(&path, &[n_frames, n_spatial, n_spectral], &data).unwrap();
        let dark = DarkMap::zeros(n_spatial, n_spectral);
        let paths = [path.clone(), dir.join("missing.npy"), path];
        let loaded = Explorer::load(&paths, &dark, FrameLayout::Natural).unwrap();
        assert_eq!(loaded.n_frames(), 6);
        assert_eq!(loaded.failures().len(), 1);

        let csv_path = dir.join("band_flux.csv");
        loaded.to_csv(&csv_path, DEFAULT_BAND).unwrap();
        let mut rdr = csv::Reader::from_path(&csv_path).unwrap();
        assert_eq!(rdr.headers().unwrap().len(), 18);
        assert_eq!(rdr.records().count(), 6);

        let config = DarkConfig {
            layout: FrameLayout::Natural,
            ..Default::default()
        };
        let fallback =
            dark_or_fallback(dir.join("superdark.npy"), &[dir.join("data.npy")], &config).unwrap();
        assert!((fallback.get(0, 0) - 1.).abs() < 1e-12);
        assert!(matches!(
            dark_or_fallback(dir.join("superdark.npy"), &[dir.join("missing.npy")], &config),
            Err(ExplorerError::NoDark)
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
