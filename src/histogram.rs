//! Fixed-grid histograms
//!
//! Binning follows the numpy conventions: uniform edges from `linspace`,
//! half-open bins except the last one which includes the upper edge.

use rand::Rng;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HistogramError {
    #[error("invalid bin grid [{low},{high}] with {n_bins} bins")]
    Grid { low: f64, high: f64, n_bins: usize },
    #[error("cannot merge histograms with different bin grids")]
    GridMismatch,
    #[error("bin edges must be evenly spaced")]
    UnevenEdges,
    #[error("the pdf and the bin centers lengths differ ({0} vs {1})")]
    Length(usize, usize),
    #[error("at least 2 bins are required to build a cumulative distribution")]
    TooFewBins,
}
type Result<T> = std::result::Result<T, HistogramError>;

/// Uniform bin grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinGrid {
    low: f64,
    high: f64,
    n_bins: usize,
}
impl Default for BinGrid {
    /// The dark current residual grid: 1000 bins over [-2800,13700] ADU
    fn default() -> Self {
        Self {
            low: -2800.,
            high: 13700.,
            n_bins: 1000,
        }
    }
}
impl BinGrid {
    pub fn new(low: f64, high: f64, n_bins: usize) -> Result<Self> {
        if !(low.is_finite() && high.is_finite() && low < high && n_bins > 0) {
            return Err(HistogramError::Grid { low, high, n_bins });
        }
        Ok(Self { low, high, n_bins })
    }
    /// Rebuilds the grid from evenly spaced bin edges
    pub fn from_edges(edges: &[f64]) -> Result<Self> {
        let (Some(&low), Some(&high)) = (edges.first(), edges.last()) else {
            return Err(HistogramError::Grid {
                low: f64::NAN,
                high: f64::NAN,
                n_bins: 0,
            });
        };
        let grid = Self::new(low, high, edges.len().saturating_sub(1))?;
        let step = grid.step();
        if grid
            .edges()
            .iter()
            .zip(edges)
            .any(|(a, b)| (a - b).abs() > 1e-9 * step.max(1.))
        {
            return Err(HistogramError::UnevenEdges);
        }
        Ok(grid)
    }
    pub fn low(&self) -> f64 {
        self.low
    }
    pub fn high(&self) -> f64 {
        self.high
    }
    pub fn n_bins(&self) -> usize {
        self.n_bins
    }
    /// Bin width
    pub fn step(&self) -> f64 {
        (self.high - self.low) / self.n_bins as f64
    }
    /// The `n_bins+1` bin edges
    pub fn edges(&self) -> Vec<f64> {
        let step = self.step();
        (0..=self.n_bins)
            .map(|i| {
                if i == self.n_bins {
                    self.high
                } else {
                    self.low + i as f64 * step
                }
            })
            .collect()
    }
    /// The `n_bins` bin centers
    pub fn centers(&self) -> Vec<f64> {
        let step = self.step();
        (0..self.n_bins)
            .map(|i| self.low + i as f64 * step + 0.5 * step)
            .collect()
    }
    /// The bin a sample falls in, `None` if the sample is outside the grid or NaN
    pub fn bin_index(&self, x: f64) -> Option<usize> {
        if !(x >= self.low && x <= self.high) {
            return None;
        }
        if x == self.high {
            return Some(self.n_bins - 1);
        }
        let step = self.step();
        let mut index = (((x - self.low) / step) as usize).min(self.n_bins - 1);
        // guard against rounding at the bin edges
        if index > 0 && x < self.low + index as f64 * step {
            index -= 1;
        } else if index + 1 < self.n_bins && x >= self.low + (index + 1) as f64 * step {
            index += 1;
        }
        Some(index)
    }
}

/// Histogram over a fixed [BinGrid]
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    grid: BinGrid,
    counts: Vec<u64>,
}
impl Histogram {
    pub fn new(grid: BinGrid) -> Self {
        Self {
            grid,
            counts: vec![0; grid.n_bins],
        }
    }
    /// Creates a histogram from existing counts
    pub fn with_counts(grid: BinGrid, counts: Vec<u64>) -> Result<Self> {
        if counts.len() != grid.n_bins {
            return Err(HistogramError::Length(counts.len(), grid.n_bins));
        }
        Ok(Self { grid, counts })
    }
    /// Histogram of `samples` over their own range
    ///
    /// NaN samples are ignored; a constant sample set is binned over
    /// `[x-0.5,x+0.5]` and an empty one over `[0,1]`.
    pub fn from_samples(samples: &[f64], n_bins: usize) -> Result<Self> {
        let (low, high) = samples
            .iter()
            .filter(|x| x.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(l, h), &x| {
                (l.min(x), h.max(x))
            });
        let (low, high) = if low > high {
            (0., 1.)
        } else if low == high {
            (low - 0.5, high + 0.5)
        } else {
            (low, high)
        };
        let mut histogram = Self::new(BinGrid::new(low, high, n_bins)?);
        histogram.fill_iter(samples.iter().copied());
        Ok(histogram)
    }
    pub fn grid(&self) -> &BinGrid {
        &self.grid
    }
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }
    pub fn edges(&self) -> Vec<f64> {
        self.grid.edges()
    }
    pub fn centers(&self) -> Vec<f64> {
        self.grid.centers()
    }
    /// Adds a sample, returns `false` if the sample is outside the grid
    pub fn fill(&mut self, x: f64) -> bool {
        match self.grid.bin_index(x) {
            Some(i) => {
                self.counts[i] += 1;
                true
            }
            None => false,
        }
    }
    pub fn fill_iter<I: IntoIterator<Item = f64>>(&mut self, samples: I) {
        samples.into_iter().for_each(|x| {
            self.fill(x);
        });
    }
    /// Adds the counts of another histogram with the same grid
    pub fn merge(&mut self, other: &Histogram) -> Result<()> {
        if self.grid != other.grid {
            return Err(HistogramError::GridMismatch);
        }
        self.counts
            .iter_mut()
            .zip(&other.counts)
            .for_each(|(a, b)| *a += b);
        Ok(())
    }
    /// Total number of binned samples
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
    /// Probability density: counts / (total x bin width)
    ///
    /// All zeros if the histogram is empty.
    pub fn density(&self) -> Vec<f64> {
        let total = self.total();
        if total == 0 {
            return vec![0f64; self.counts.len()];
        }
        let norm = total as f64 * self.grid.step();
        self.counts.iter().map(|&c| c as f64 / norm).collect()
    }
}

/// Linear interpolation of `(xp,fp)` at `x`, clamped to the end values
///
/// `xp` must be sorted in increasing order.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len().min(fp.len());
    match n {
        0 => return f64::NAN,
        1 => return fp[0],
        _ => (),
    }
    if x < xp[0] {
        return fp[0];
    }
    if x > xp[n - 1] {
        return fp[n - 1];
    }
    let (mut low, mut high) = (0usize, n - 1);
    while high - low > 1 {
        let mid = (high + low) / 2;
        if xp[mid] <= x {
            low = mid;
        } else {
            high = mid;
        }
    }
    fp[low] + (x - xp[low]) * (fp[low + 1] - fp[low]) / (xp[low + 1] - xp[low])
}

/// Random variate generator following an arbitrary tabulated pdf
///
/// Uniform variates are mapped through the inverse of the cumulative
/// distribution of the pdf.
#[derive(Debug, Clone)]
pub struct InverseCdfSampler {
    cdf: Vec<f64>,
    values: Vec<f64>,
}
impl InverseCdfSampler {
    /// Creates the sampler from a normalized pdf tabulated at evenly spaced bin centers
    pub fn new(bin_centers: &[f64], pdf: &[f64]) -> Result<Self> {
        if bin_centers.len() != pdf.len() {
            return Err(HistogramError::Length(pdf.len(), bin_centers.len()));
        }
        if bin_centers.len() < 2 {
            return Err(HistogramError::TooFewBins);
        }
        let bin_width = bin_centers[1] - bin_centers[0];
        let mut cdf = Vec::with_capacity(pdf.len());
        let mut values = Vec::with_capacity(pdf.len());
        let mut cumulative = 0f64;
        for (&center, &p) in bin_centers.iter().zip(pdf) {
            cumulative += p;
            let c = cumulative * bin_width;
            // keep the first bin of each plateau of the cumulative distribution
            if cdf.last().map_or(true, |&last| c > last) {
                cdf.push(c);
                values.push(center + 0.5 * bin_width);
            }
        }
        Ok(Self { cdf, values })
    }
    /// Creates the sampler from the density of a histogram
    pub fn from_histogram(histogram: &Histogram) -> Result<Self> {
        Self::new(&histogram.centers(), &histogram.density())
    }
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        interp(rng.gen::<f64>(), &self.cdf, &self.values)
    }
    pub fn samples<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<f64> {
        (0..n).map(|_| self.sample(rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn default_dark_grid() {
        let grid = BinGrid::default();
        let edges = grid.edges();
        assert_eq!(edges.len(), 1001);
        assert_eq!(edges[0], -2800.);
        assert_eq!(edges[1000], 13700.);
        assert!((grid.step() - 16.5).abs() < 1e-12);
        assert!((grid.centers()[0] + 2791.75).abs() < 1e-9);
    }

    #[test]
    fn numpy_edge_semantics() {
        let grid = BinGrid::new(0., 10., 10).unwrap();
        assert_eq!(grid.bin_index(0.), Some(0));
        assert_eq!(grid.bin_index(1.), Some(1));
        assert_eq!(grid.bin_index(9.999), Some(9));
        assert_eq!(grid.bin_index(10.), Some(9));
        assert_eq!(grid.bin_index(10.0001), None);
        assert_eq!(grid.bin_index(-1e-9), None);
        assert_eq!(grid.bin_index(f64::NAN), None);
    }

    #[test]
    fn invalid_grid() {
        assert!(BinGrid::new(1., 1., 10).is_err());
        assert!(BinGrid::new(0., 1., 0).is_err());
        assert!(BinGrid::new(f64::NAN, 1., 3).is_err());
    }

    #[test]
    fn edges_round_trip_into_grid() {
        let grid = BinGrid::default();
        assert_eq!(BinGrid::from_edges(&grid.edges()).unwrap(), grid);
        assert_eq!(
            BinGrid::from_edges(&[0., 1., 3.]),
            Err(HistogramError::UnevenEdges)
        );
    }

    #[test]
    fn merging_adds_counts() {
        let grid = BinGrid::new(-1., 1., 4).unwrap();
        let mut a = Histogram::new(grid);
        a.fill_iter([-0.9, 0.1, 0.2, 5.]);
        let mut b = Histogram::new(grid);
        b.fill_iter([0.9, 1.]);
        a.merge(&b).unwrap();
        assert_eq!(a.counts(), &[1, 0, 2, 2]);
        assert_eq!(a.total(), 5);

        let c = Histogram::new(BinGrid::new(-1., 1., 5).unwrap());
        assert_eq!(a.merge(&c), Err(HistogramError::GridMismatch));
    }

    #[test]
    fn density_integrates_to_one() {
        let histogram = Histogram::from_samples(&[0., 1., 1., 2., 3., f64::NAN], 3).unwrap();
        assert_eq!(histogram.total(), 5);
        let step = histogram.grid().step();
        let integral: f64 = histogram.density().iter().map(|d| d * step).sum();
        assert!((integral - 1.).abs() < 1e-12);
        assert!(Histogram::new(BinGrid::default())
            .density()
            .iter()
            .all(|&d| d == 0.));
    }

    #[test]
    fn constant_samples() {
        let histogram = Histogram::from_samples(&[2., 2., 2.], 4).unwrap();
        assert_eq!(histogram.grid().low(), 1.5);
        assert_eq!(histogram.grid().high(), 2.5);
        assert_eq!(histogram.total(), 3);
    }

    #[test]
    fn interpolation_is_clamped() {
        let xp = [0., 1., 2.];
        let fp = [10., 20., 40.];
        assert_eq!(interp(-1., &xp, &fp), 10.);
        assert_eq!(interp(0.5, &xp, &fp), 15.);
        assert_eq!(interp(1.5, &xp, &fp), 30.);
        assert_eq!(interp(3., &xp, &fp), 40.);
    }

    #[test]
    fn sampler_follows_the_pdf() {
        // uniform pdf over [0,4)
        let centers = [0.5, 1.5, 2.5, 3.5];
        let pdf = [0.25; 4];
        let sampler = InverseCdfSampler::new(&centers, &pdf).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let samples = sampler.samples(&mut rng, 20_000);
        // the cdf is anchored on the upper bin edges, a quarter of the
        // variates are clamped to the first one
        assert!(samples.iter().all(|&x| (1.0..=4.0).contains(&x)));
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((mean - 2.125).abs() < 0.05, "mean: {mean}");
    }

    #[test]
    fn sampler_skips_cdf_plateaus() {
        let centers = [0., 1., 2., 3.];
        let pdf = [0.5, 0., 0., 0.5];
        let sampler = InverseCdfSampler::new(&centers, &pdf).unwrap();
        assert_eq!(sampler.cdf, vec![0.5, 1.]);
        assert_eq!(sampler.values, vec![0.5, 3.5]);
        assert!(InverseCdfSampler::new(&[0.], &[1.]).is_err());
    }
}
