//! Dark current aggregation
//!
//! The dark exposures are reduced into:
//!  - the average dark map, subtracted from the science frames,
//!  - the histogram of the zero-mean dark current, used to model the detector noise.
//!
//! Files are accumulated independently into [DarkAccumulator]s that are merged
//! together, so the reduction of a set of files can be spread over threads.

use std::{
    fmt,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    str::FromStr,
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    frames::{DarkMap, FileFailure, FrameCube, FrameLayout, FramesError, Image, DETECTOR_SHAPE},
    histogram::{BinGrid, Histogram, HistogramError},
};

/// Average dark map file name
pub const SUPERDARK: &str = "superdark.npy";
/// Dark histogram file name
pub const HIST_DARK: &str = "hist_dark.pkl";

#[derive(thiserror::Error, Debug)]
pub enum DarkError {
    #[error("dark frames error")]
    Frames(#[from] FramesError),
    #[error("dark histogram error")]
    Histogram(#[from] HistogramError),
    #[error("invalid acquisition date {0:?}, expected YYYY-MM-DD")]
    Date(String),
    #[error("failed to access {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to (de)serialize the dark histogram")]
    Pickle(#[from] serde_pickle::Error),
}
type Result<T> = std::result::Result<T, DarkError>;

/// Acquisition date tag `YYYY-MM-DD`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionDate(String);
impl FromStr for AcquisitionDate {
    type Err = DarkError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DarkError::Date(s.to_string());
        let mut fields = s.split('-');
        let (Some(year), Some(month), Some(day), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(invalid());
        };
        let number = |field: &str, width: usize| -> Option<u32> {
            (field.len() == width && field.bytes().all(|b| b.is_ascii_digit()))
                .then(|| field.parse().ok())
                .flatten()
        };
        match (number(year, 4), number(month, 2), number(day, 2)) {
            (Some(_), Some(1..=12), Some(1..=31)) => Ok(Self(s.to_string())),
            _ => Err(invalid()),
        }
    }
}
impl fmt::Display for AcquisitionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl AcquisitionDate {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Dark reduction settings
#[derive(Debug, Clone)]
pub struct DarkConfig {
    /// Bins of the residual histogram
    pub grid: BinGrid,
    /// Axes ordering in the dark files
    pub layout: FrameLayout,
    /// Collects per-frame statistics when set
    pub monitor: bool,
    /// (spatial, spectral) detector shape
    pub shape: (usize, usize),
}
impl Default for DarkConfig {
    fn default() -> Self {
        Self {
            grid: BinGrid::default(),
            layout: FrameLayout::Transposed,
            monitor: false,
            shape: DETECTOR_SHAPE,
        }
    }
}

/// Per-frame mean and variance of the dark frames
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DarkMonitor {
    pub frame_means: Vec<f64>,
    pub frame_variances: Vec<f64>,
}
impl DarkMonitor {
    fn extend(&mut self, cube: &FrameCube) {
        self.frame_means.extend(cube.frame_means());
        self.frame_variances.extend(cube.frame_variances());
    }
    fn merge(mut self, other: Self) -> Self {
        self.frame_means.extend(other.frame_means);
        self.frame_variances.extend(other.frame_variances);
        self
    }
    fn histogram(samples: &[f64]) -> Result<Histogram> {
        let n_bins = ((samples.len() as f64).sqrt().floor() as usize).max(1);
        Ok(Histogram::from_samples(samples, n_bins)?)
    }
    /// Histogram of the frame means with `floor(sqrt(n))` bins
    pub fn mean_histogram(&self) -> Result<Histogram> {
        Self::histogram(&self.frame_means)
    }
    /// Histogram of the frame variances with `floor(sqrt(n))` bins
    pub fn variance_histogram(&self) -> Result<Histogram> {
        Self::histogram(&self.frame_variances)
    }
}

/// Running sums of the dark reduction
#[derive(Debug, Clone)]
pub struct DarkAccumulator {
    sum: Image,
    n_frames: usize,
    histogram: Histogram,
    monitor: Option<DarkMonitor>,
    failures: Vec<FileFailure>,
}
impl DarkAccumulator {
    pub fn new(config: &DarkConfig) -> Self {
        let (n_spatial, n_spectral) = config.shape;
        Self {
            sum: Image::zeros(n_spatial, n_spectral),
            n_frames: 0,
            histogram: Histogram::new(config.grid),
            monitor: config.monitor.then(DarkMonitor::default),
            failures: vec![],
        }
    }
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }
    pub fn failures(&self) -> &[FileFailure] {
        &self.failures
    }
    /// Adds the frames of a dark cube
    ///
    /// Each frame is made zero-mean before being histogrammed.
    /// The accumulator is left untouched if the frame shape does not match the detector.
    pub fn add_cube(&mut self, cube: &FrameCube) -> Result<()> {
        self.sum.accumulate(&cube.sum_frames())?;
        self.n_frames += cube.n_frames();
        for (frame, mean) in cube.frames().zip(cube.frame_means()) {
            self.histogram.fill_iter(frame.iter().map(|x| x - mean));
        }
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.extend(cube);
        }
        Ok(())
    }
    /// Loads and adds a dark file
    ///
    /// A file that cannot be read or that does not match the detector shape
    /// is skipped and recorded as a failure.
    pub fn add_file<P: AsRef<Path>>(mut self, path: P, layout: FrameLayout) -> Self {
        let path = path.as_ref();
        let added = FrameCube::from_path(path, layout)
            .map_err(DarkError::from)
            .and_then(|cube| self.add_cube(&cube));
        if let Err(e) = added {
            let failure = FileFailure::from_error(path, &e);
            log::warn!("Skipping {:?}: {}", path, failure.reason);
            self.failures.push(failure);
        }
        self
    }
    /// Merges two accumulators
    pub fn merge(mut self, other: Self) -> Result<Self> {
        self.sum.accumulate(&other.sum)?;
        self.n_frames += other.n_frames;
        self.histogram.merge(&other.histogram)?;
        self.monitor = match (self.monitor, other.monitor) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.or(b),
        };
        self.failures.extend(other.failures);
        Ok(self)
    }
    /// Averages the dark frames
    pub fn finish(self) -> DarkReduction {
        if self.n_frames == 0 {
            log::warn!("No dark frame accumulated, the average dark is not computed");
        }
        DarkReduction {
            average: self.sum.divided_by(self.n_frames),
            histogram: self.histogram,
            n_frames: self.n_frames,
            failures: self.failures,
            monitor: self.monitor,
        }
    }
}

/// Outcome of the dark reduction
#[derive(Debug, Clone)]
pub struct DarkReduction {
    /// The average dark, `None` if no frame was accumulated
    pub average: Option<DarkMap>,
    /// Histogram of the zero-mean dark frames
    pub histogram: Histogram,
    pub n_frames: usize,
    pub failures: Vec<FileFailure>,
    pub monitor: Option<DarkMonitor>,
}
impl DarkReduction {
    /// Writes `superdark.npy` and `hist_dark.pkl` into `dir`, overwriting existing files
    ///
    /// `superdark.npy` is not written if no frame was accumulated.
    pub fn save<P: AsRef<Path>>(&self, dir: P, date: &AcquisitionDate) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| DarkError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if let Some(average) = &self.average {
            let path = dir.join(SUPERDARK);
            log::info!("Saving {:?}...", path);
            average.to_path(path)?;
        }
        let path = dir.join(HIST_DARK);
        log::info!("Saving {:?}...", path);
        DarkHistogramRecord::new(&self.histogram, date).to_path(path)
    }
}

/// Accumulates dark files in parallel
pub fn aggregate<I>(paths: I, config: &DarkConfig) -> Result<DarkReduction>
where
    I: ParallelIterator,
    I::Item: AsRef<Path>,
{
    paths
        .fold(
            || DarkAccumulator::new(config),
            |acc, path| acc.add_file(path, config.layout),
        )
        .map(Ok::<_, DarkError>)
        .try_reduce(|| DarkAccumulator::new(config), DarkAccumulator::merge)
        .map(DarkAccumulator::finish)
}

/// Reduces a list of dark files into the average dark and the residual histogram
pub fn aggregate_darks<P>(paths: &[P], config: &DarkConfig) -> Result<DarkReduction>
where
    P: AsRef<Path> + Sync,
{
    log::info!("Reducing {} dark files...", paths.len());
    let reduction = aggregate(paths.par_iter(), config)?;
    log::info!(
        "... {} frames, {} files skipped",
        reduction.n_frames,
        reduction.failures.len()
    );
    Ok(reduction)
}

/// Persisted dark histogram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DarkHistogramRecord {
    /// Acquisition date `YYYY-MM-DD`
    pub date: String,
    pub histogram: Vec<u64>,
    pub bins_edges: Vec<f64>,
}
impl DarkHistogramRecord {
    pub fn new(histogram: &Histogram, date: &AcquisitionDate) -> Self {
        Self {
            date: date.to_string(),
            histogram: histogram.counts().to_vec(),
            bins_edges: histogram.edges(),
        }
    }
    pub fn to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = BufWriter::new(File::create(path).map_err(|source| DarkError::Io {
            path: path.to_path_buf(),
            source,
        })?);
        serde_pickle::to_writer(&mut file, self, Default::default())?;
        Ok(())
    }
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading {:?}...", path);
        let file = File::open(path).map_err(|source| DarkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_pickle::from_reader(
            BufReader::new(file),
            Default::default(),
        )?)
    }
    pub fn date(&self) -> Result<AcquisitionDate> {
        self.date.parse()
    }
    /// Rebuilds the histogram from the counts and the bin edges
    pub fn to_histogram(&self) -> Result<Histogram> {
        let grid = BinGrid::from_edges(&self.bins_edges)?;
        Ok(Histogram::with_counts(grid, self.histogram.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(shape: (usize, usize)) -> DarkConfig {
        DarkConfig {
            layout: FrameLayout::Natural,
            shape,
            ..Default::default()
        }
    }

    fn cube(n_frames: usize, offset: f64) -> FrameCube {
        let data = (0..n_frames * 6)
            .map(|i| offset + (i % 7) as f64 * 10.)
            .collect();
        FrameCube::new(n_frames, 2, 3, data).unwrap()
    }

    #[test]
    fn acquisition_date() {
        let date: AcquisitionDate = "2018-06-25".parse().unwrap();
        assert_eq!(date.to_string(), "2018-06-25");
        for bad in ["2018-6-25", "2018-13-01", "2018-06-00", "18-06-25", "2018/06/25", "2018-06-25-1"] {
            assert!(bad.parse::<AcquisitionDate>().is_err(), "{bad}");
        }
    }

    #[test]
    fn average_is_the_mean_of_all_frames() {
        let config = config((2, 3));
        let (a, b) = (cube(3, 100.), cube(5, -40.));
        let mut acc = DarkAccumulator::new(&config);
        acc.add_cube(&a).unwrap();
        let mut other = DarkAccumulator::new(&config);
        other.add_cube(&b).unwrap();
        let reduction = acc.merge(other).unwrap().finish();
        assert_eq!(reduction.n_frames, 8);
        let all = FrameCube::concat(vec![a, b]).unwrap();
        let expected = all.mean_frame().unwrap();
        let average = reduction.average.unwrap();
        for (x, y) in average.as_slice().iter().zip(expected.as_slice()) {
            assert!((x - y).abs() < 1e-12);
        }
        // every residual is within the default grid
        assert_eq!(reduction.histogram.total(), 8 * 6);
    }

    #[test]
    fn residuals_are_zero_mean() {
        let config = DarkConfig {
            grid: BinGrid::new(-2., 2., 4).unwrap(),
            ..config((1, 4))
        };
        let mut acc = DarkAccumulator::new(&config);
        let cube = FrameCube::new(1, 1, 4, vec![9., 10., 10., 11.]).unwrap();
        acc.add_cube(&cube).unwrap();
        let reduction = acc.finish();
        assert_eq!(reduction.histogram.counts(), &[0, 1, 2, 1]);
    }

    #[test]
    fn no_frame_no_average() {
        let reduction = DarkAccumulator::new(&config((2, 3))).finish();
        assert_eq!(reduction.n_frames, 0);
        assert!(reduction.average.is_none());
        assert_eq!(reduction.histogram.total(), 0);
    }

    #[test]
    fn mismatched_cube_leaves_the_sums_untouched() {
        let mut acc = DarkAccumulator::new(&config((3, 3)));
        assert!(acc.add_cube(&cube(2, 0.)).is_err());
        assert_eq!(acc.n_frames(), 0);
    }

    #[test]
    fn monitor_collects_every_frame() {
        let config = DarkConfig {
            monitor: true,
            ..config((2, 3))
        };
        let mut acc = DarkAccumulator::new(&config);
        acc.add_cube(&cube(4, 0.)).unwrap();
        acc.add_cube(&cube(5, 0.)).unwrap();
        let monitor = acc.finish().monitor.unwrap();
        assert_eq!(monitor.frame_means.len(), 9);
        let histogram = monitor.mean_histogram().unwrap();
        assert_eq!(histogram.grid().n_bins(), 3);
        assert_eq!(histogram.total(), 9);
    }

    #[test]
    fn parallel_reduction_skips_unreadable_files() {
        let dir = std::env::temp_dir().join("glint-drs_dark");
        fs::create_dir_all(&dir).unwrap();
        let mut paths = vec![];
        for k in 0..4 {
            let path = dir.join(format!("dark{k}.npy"));
            let cube = cube(k + 1, k as f64);
            frames_to_path(&cube, &path);
            paths.push(path);
        }
        paths.insert(2, dir.join("missing.npy"));
        let reduction = aggregate_darks(&paths, &config((2, 3))).unwrap();
        assert_eq!(reduction.n_frames, 1 + 2 + 3 + 4);
        assert_eq!(reduction.histogram.total(), 10 * 6);
        assert_eq!(reduction.failures.len(), 1);
        assert_eq!(reduction.failures[0].path, dir.join("missing.npy"));

        let date = "2018-06-25".parse().unwrap();
        reduction.save(&dir, &date).unwrap();
        let average = Image::from_path(dir.join(SUPERDARK)).unwrap();
        assert_eq!(Some(average), reduction.average);
        let record = DarkHistogramRecord::from_path(dir.join(HIST_DARK)).unwrap();
        assert_eq!(record.date().unwrap(), date);
        assert_eq!(record.bins_edges.len(), 1001);
        assert_eq!(record.to_histogram().unwrap(), reduction.histogram);
        fs::remove_dir_all(dir).unwrap();
    }

    fn frames_to_path(cube: &FrameCube, path: &Path) {
        let (n_frames, n_spatial, n_spectral) = cube.shape();
        let data: Vec<f64> = cube.frames().flatten().copied().collect();
        crate::frames::write_array(path, &[n_frames, n_spatial, n_spectral], &data).unwrap();
    }
}
