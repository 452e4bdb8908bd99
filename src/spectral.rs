//! Polynomials and wavelength scales
//!
//! Polynomial coefficients are stored from the highest degree down to the
//! constant term, the same ordering as the calibration files written by the
//! spectral calibration (`*_px_to_wl.npy`, `*_wl_to_px.npy`).

use std::path::Path;

use nalgebra::{DMatrix, DVector};

use crate::frames::{self, FramesError};

#[derive(thiserror::Error, Debug)]
pub enum SpectralError {
    #[error("failed to load the wavelength calibration")]
    Frames(#[from] FramesError),
    #[error("expected a 2-D coefficients array, found shape {0:?}")]
    Dimension(Vec<usize>),
    #[error("{points} points cannot constrain a degree {degree} polynomial")]
    TooFewPoints { points: usize, degree: usize },
    #[error("abscissa, ordinate and weights lengths differ")]
    Length,
    #[error("least squares solve failed: {0}")]
    Solve(&'static str),
    #[error("track #{track} is not calibrated ({n_tracks} tracks)")]
    Track { track: usize, n_tracks: usize },
}
type Result<T> = std::result::Result<T, SpectralError>;

/// Polynomial with coefficients ordered from the highest degree down
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    coefficients: Vec<f64>,
}
impl Polynomial {
    pub fn new(coefficients: Vec<f64>) -> Self {
        Self { coefficients }
    }
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }
    /// Evaluates the polynomial at `x` (Horner scheme)
    pub fn eval(&self, x: f64) -> f64 {
        self.coefficients.iter().fold(0f64, |acc, c| acc * x + c)
    }
    /// Weighted least squares fit of a `degree` polynomial to `(x,y)`
    ///
    /// The weights multiply the residuals, `sum((w·(y - p(x)))^2)` is minimized.
    pub fn fit(x: &[f64], y: &[f64], degree: usize, weights: Option<&[f64]>) -> Result<Self> {
        if x.len() != y.len() || weights.is_some_and(|w| w.len() != x.len()) {
            return Err(SpectralError::Length);
        }
        let n_coefs = degree + 1;
        if x.len() < n_coefs {
            return Err(SpectralError::TooFewPoints {
                points: x.len(),
                degree,
            });
        }
        let weight = |i: usize| weights.map_or(1f64, |w| w[i]);
        let mut vandermonde = DMatrix::<f64>::from_fn(x.len(), n_coefs, |i, j| {
            weight(i) * x[i].powi((degree - j) as i32)
        });
        let rhs = DVector::<f64>::from_fn(y.len(), |i, _| weight(i) * y[i]);
        // column scaling for conditioning
        let scales: Vec<f64> = vandermonde
            .column_iter()
            .map(|column| {
                let norm = column.norm();
                if norm > 0. {
                    norm
                } else {
                    1.
                }
            })
            .collect();
        vandermonde
            .column_iter_mut()
            .zip(&scales)
            .for_each(|(mut column, scale)| column /= *scale);
        let svd = vandermonde.svd(true, true);
        let eps = f64::EPSILON * x.len() as f64 * svd.singular_values.max();
        let solution = svd.solve(&rhs, eps).map_err(SpectralError::Solve)?;
        Ok(Self::new(
            solution
                .iter()
                .zip(&scales)
                .map(|(c, scale)| c / scale)
                .collect(),
        ))
    }
}

/// Pixel to wavelength polynomials, one per track
#[derive(Debug, Clone, PartialEq)]
pub struct WavelengthCalibration {
    polynomials: Vec<Polynomial>,
}
impl WavelengthCalibration {
    pub fn new(polynomials: Vec<Polynomial>) -> Self {
        Self { polynomials }
    }
    /// The identity calibration, wavelengths are in pixels
    pub fn pixels(n_tracks: usize) -> Self {
        Self::new(vec![Polynomial::new(vec![1., 0.]); n_tracks])
    }
    /// Loads a 2-D `.npy` array of coefficients, one row per track
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (shape, coefficients) = frames::read_array(path, "coefficients")?;
        let [_, n_coefs] = shape[..] else {
            return Err(SpectralError::Dimension(shape.to_vec()));
        };
        Ok(Self::new(
            coefficients
                .chunks(n_coefs.max(1))
                .map(|row| Polynomial::new(row.to_vec()))
                .collect(),
        ))
    }
    /// Saves the coefficients into a 2-D `.npy` array
    pub fn to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_polynomials(path, &self.polynomials)
    }
    pub fn n_tracks(&self) -> usize {
        self.polynomials.len()
    }
    pub fn polynomial(&self, track: usize) -> Result<&Polynomial> {
        self.polynomials.get(track).ok_or(SpectralError::Track {
            track,
            n_tracks: self.polynomials.len(),
        })
    }
    /// The wavelength of every spectral channel of a track
    pub fn scale(&self, track: usize, n_spectral: usize) -> Result<Vec<f64>> {
        let polynomial = self.polynomial(track)?;
        Ok((0..n_spectral).map(|k| polynomial.eval(k as f64)).collect())
    }
    /// The mean wavelength step between consecutive spectral channels of a track
    pub fn step(&self, track: usize, n_spectral: usize) -> Result<f64> {
        let scale = self.scale(track, n_spectral)?;
        if scale.len() < 2 {
            return Ok(0.);
        }
        Ok((scale[scale.len() - 1] - scale[0]) / (scale.len() - 1) as f64)
    }
}

/// Saves polynomials of the same degree as the rows of a 2-D `.npy` array
pub fn save_polynomials<P: AsRef<Path>>(path: P, polynomials: &[Polynomial]) -> Result<()> {
    let n_coefs = polynomials
        .first()
        .map_or(0, |p| p.coefficients().len());
    if polynomials
        .iter()
        .any(|p| p.coefficients().len() != n_coefs)
    {
        return Err(SpectralError::Length);
    }
    let data: Vec<f64> = polynomials
        .iter()
        .flat_map(|p| p.coefficients().iter().copied())
        .collect();
    frames::write_array(path, &[polynomials.len(), n_coefs], &data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horner() {
        // 2x² - 3x + 1
        let p = Polynomial::new(vec![2., -3., 1.]);
        assert_eq!(p.degree(), 2);
        assert_eq!(p.eval(0.), 1.);
        assert_eq!(p.eval(2.), 3.);
        assert_eq!(Polynomial::new(vec![]).eval(1.), 0.);
    }

    #[test]
    fn polyfit_recovers_the_coefficients() {
        let truth = Polynomial::new(vec![1e-6, -2e-4, 0.01, 0.5, 33.]);
        let x: Vec<f64> = (0..96).map(|k| k as f64).collect();
        let y: Vec<f64> = x.iter().map(|&x| truth.eval(x)).collect();
        let fit = Polynomial::fit(&x, &y, 4, None).unwrap();
        for (a, b) in fit.coefficients().iter().zip(truth.coefficients()) {
            assert!((a - b).abs() < 1e-8 * b.abs().max(1.), "{a} vs {b}");
        }
    }

    #[test]
    fn zero_weights_ignore_outliers() {
        let x = [0., 1., 2., 3., 4.];
        let y = [1., 3., 5., 100., 9.];
        let w = [1., 1., 1., 0., 1.];
        let fit = Polynomial::fit(&x, &y, 1, Some(&w)).unwrap();
        assert!((fit.coefficients()[0] - 2.).abs() < 1e-9);
        assert!((fit.coefficients()[1] - 1.).abs() < 1e-9);
    }

    #[test]
    fn polyfit_validation() {
        assert!(matches!(
            Polynomial::fit(&[0., 1.], &[0., 1.], 2, None),
            Err(SpectralError::TooFewPoints { .. })
        ));
        assert!(matches!(
            Polynomial::fit(&[0., 1.], &[0.], 0, None),
            Err(SpectralError::Length)
        ));
    }

    #[test]
    fn wavelength_scale() {
        let calibration = WavelengthCalibration::new(vec![
            Polynomial::new(vec![-3., 1700.]),
            Polynomial::new(vec![-2.5, 1690.]),
        ]);
        assert_eq!(calibration.scale(1, 3).unwrap(), vec![1690., 1687.5, 1685.]);
        assert_eq!(calibration.step(0, 96).unwrap(), -3.);
        assert!(matches!(
            calibration.scale(2, 3),
            Err(SpectralError::Track { track: 2, .. })
        ));
        assert_eq!(
            WavelengthCalibration::pixels(16).scale(3, 4).unwrap(),
            vec![0., 1., 2., 3.]
        );
    }

    #[test]
    fn calibration_file_round_trip() {
        let path = std::env::temp_dir().join("glint-drs_px_to_wl.npy");
        let calibration = WavelengthCalibration::new(vec![
            Polynomial::new(vec![1e-3, -3., 1700.]),
            Polynomial::new(vec![2e-3, -2.5, 1690.]),
        ]);
        calibration.to_path(&path).unwrap();
        assert_eq!(WavelengthCalibration::from_path(&path).unwrap(), calibration);
        std::fs::remove_file(path).unwrap();
    }
}
