//! Detector frame cubes and 2-D detector images
//!
//! Frame cubes are read from `.npy` files holding a 3-D array, or from `.npz`
//! archives with an `imagedata` entry. Samples of any integer or float dtype
//! are promoted to `f64`.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read},
    ops::Range,
    path::{Path, PathBuf},
};

use glob::glob;
use npyz::{npz::NpzArchive, NpyFile, WriterBuilder};

#[derive(thiserror::Error, Debug)]
pub enum FramesError {
    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no `{entry}` array in {path:?}")]
    MissingEntry { path: PathBuf, entry: String },
    #[error("unsupported array dtype {0}")]
    DType(String),
    #[error("expected a {expected}-D array, found shape {found:?}")]
    Dimension { expected: usize, found: Vec<u64> },
    #[error("expected {expected} samples, found {found}")]
    Length { expected: usize, found: usize },
    #[error("image shape {found:?} does not match the detector shape {expected:?}")]
    Shape {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("cannot stack an empty list of frame cubes")]
    EmptyStack,
    #[error("invalid file pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("failed to list files")]
    Glob(#[from] glob::GlobError),
}
type Result<T> = std::result::Result<T, FramesError>;

/// A file that could not be processed and the reason why
#[derive(Debug, Clone, PartialEq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}
impl FileFailure {
    pub fn new<P: AsRef<Path>>(path: P, reason: impl std::fmt::Display) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }
    /// The failure reason is the error message followed by its sources
    pub fn from_error<P: AsRef<Path>>(path: P, error: &dyn std::error::Error) -> Self {
        let mut reason = error.to_string();
        let mut source = error.source();
        while let Some(error) = source {
            reason.push_str(": ");
            reason.push_str(&error.to_string());
            source = error.source();
        }
        Self::new(path, reason)
    }
}

/// (spatial, spectral) shape of the GLINT detector frames
pub const DETECTOR_SHAPE: (usize, usize) = (344, 96);

/// Ordering of the two detector axes in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameLayout {
    /// (frame, spatial, spectral)
    #[default]
    Natural,
    /// (frame, spectral, spatial), as written by the instrument
    Transposed,
}

/// Lists the files in `dir` matching the glob `pattern`, sorted by name
pub fn list_files<P: AsRef<Path>>(dir: P, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = dir.as_ref().join(pattern);
    let mut files = glob(&pattern.to_string_lossy())?
        .collect::<std::result::Result<Vec<PathBuf>, glob::GlobError>>()?;
    files.retain(|path| path.is_file());
    files.sort();
    Ok(files)
}

fn promote<R: Read>(npy: NpyFile<R>) -> std::io::Result<std::result::Result<Vec<f64>, String>> {
    let descr = match npy.dtype() {
        npyz::DType::Plain(type_str) => type_str.to_string(),
        other => return Ok(Err(format!("{:?}", other))),
    };
    let data = match descr.get(1..).unwrap_or_default() {
        "f8" => npy.into_vec::<f64>()?,
        "f4" => npy.into_vec::<f32>()?.into_iter().map(f64::from).collect(),
        "u1" => npy.into_vec::<u8>()?.into_iter().map(f64::from).collect(),
        "u2" => npy.into_vec::<u16>()?.into_iter().map(f64::from).collect(),
        "u4" => npy.into_vec::<u32>()?.into_iter().map(f64::from).collect(),
        "u8" => npy.into_vec::<u64>()?.into_iter().map(|x| x as f64).collect(),
        "i1" => npy.into_vec::<i8>()?.into_iter().map(f64::from).collect(),
        "i2" => npy.into_vec::<i16>()?.into_iter().map(f64::from).collect(),
        "i4" => npy.into_vec::<i32>()?.into_iter().map(f64::from).collect(),
        "i8" => npy.into_vec::<i64>()?.into_iter().map(|x| x as f64).collect(),
        _ => return Ok(Err(descr)),
    };
    Ok(Ok(data))
}

/// Reorders column-major samples into row-major order
fn fortran_to_c(data: Vec<f64>, shape: &[usize]) -> Vec<f64> {
    if shape.len() < 2 {
        return data;
    }
    let mut strides = vec![1usize; shape.len()];
    for k in 1..shape.len() {
        strides[k] = strides[k - 1] * shape[k - 1];
    }
    let mut index = vec![0usize; shape.len()];
    let mut reordered = Vec::with_capacity(data.len());
    for _ in 0..data.len() {
        let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
        reordered.push(data[offset]);
        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    reordered
}

fn decode<R: Read>(npy: NpyFile<R>, path: &Path) -> Result<(Vec<usize>, Vec<f64>)> {
    let shape: Vec<usize> = npy.shape().iter().map(|&n| n as usize).collect();
    let fortran = matches!(npy.order(), npyz::Order::Fortran);
    let data = promote(npy)
        .map_err(|source| FramesError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .map_err(FramesError::DType)?;
    let data = if fortran {
        fortran_to_c(data, &shape)
    } else {
        data
    };
    Ok((shape, data))
}

/// Reads an array from a `.npy` file, or the `entry` array of a `.npz` archive
///
/// Returns the array shape and its samples in row-major order.
pub fn read_array<P: AsRef<Path>>(path: P, entry: &str) -> Result<(Vec<usize>, Vec<f64>)> {
    let path = path.as_ref();
    let read_err = |source| FramesError::Read {
        path: path.to_path_buf(),
        source,
    };
    if path.extension().is_some_and(|ext| ext == "npz") {
        let mut npz = NpzArchive::open(path).map_err(read_err)?;
        let npy = npz
            .by_name(entry)
            .map_err(read_err)?
            .ok_or_else(|| FramesError::MissingEntry {
                path: path.to_path_buf(),
                entry: entry.to_string(),
            })?;
        decode(npy, path)
    } else {
        let file = File::open(path).map_err(read_err)?;
        let npy = NpyFile::new(BufReader::new(file)).map_err(read_err)?;
        decode(npy, path)
    }
}

/// Writes row-major `data` with the given `shape` into a `.npy` file
pub fn write_array<P: AsRef<Path>>(path: P, shape: &[usize], data: &[f64]) -> Result<()> {
    let path = path.as_ref();
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(FramesError::Length {
            expected,
            found: data.len(),
        });
    }
    let write_err = |source| FramesError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(write_err)?;
    let shape: Vec<u64> = shape.iter().map(|&n| n as u64).collect();
    let mut writer = npyz::WriteOptions::<f64>::new()
        .default_dtype()
        .shape(&shape)
        .writer(BufWriter::new(file))
        .begin_nd()
        .map_err(write_err)?;
    for value in data {
        writer.push(value).map_err(write_err)?;
    }
    writer.finish().map_err(write_err)?;
    Ok(())
}

/// A 2-D detector image of shape (spatial, spectral)
///
/// Used for the average dark map and for averaged science frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    n_spatial: usize,
    n_spectral: usize,
    data: Vec<f64>,
}
/// The average dark current per pixel
pub type DarkMap = Image;

impl Image {
    pub fn zeros(n_spatial: usize, n_spectral: usize) -> Self {
        Self {
            n_spatial,
            n_spectral,
            data: vec![0f64; n_spatial * n_spectral],
        }
    }
    pub fn new(n_spatial: usize, n_spectral: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_spatial * n_spectral {
            return Err(FramesError::Length {
                expected: n_spatial * n_spectral,
                found: data.len(),
            });
        }
        Ok(Self {
            n_spatial,
            n_spectral,
            data,
        })
    }
    /// Loads a 2-D `.npy` array
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (shape, data) = read_array(path, "dark")?;
        match shape[..] {
            [n_spatial, n_spectral] => Self::new(n_spatial, n_spectral, data),
            _ => Err(FramesError::Dimension {
                expected: 2,
                found: shape.iter().map(|&n| n as u64).collect(),
            }),
        }
    }
    /// Saves the image into a 2-D `.npy` array
    pub fn to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_array(path, &[self.n_spatial, self.n_spectral], &self.data)
    }
    /// (spatial, spectral) shape
    pub fn shape(&self) -> (usize, usize) {
        (self.n_spatial, self.n_spectral)
    }
    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.data[row * self.n_spectral + column]
    }
    /// The spectrum along the spectral axis at a given spatial row
    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.n_spectral..(row + 1) * self.n_spectral]
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
    fn check_shape(&self, shape: (usize, usize)) -> Result<()> {
        if self.shape() != shape {
            return Err(FramesError::Shape {
                expected: self.shape(),
                found: shape,
            });
        }
        Ok(())
    }
    /// Adds `other` pixel by pixel
    pub fn accumulate(&mut self, other: &Image) -> Result<()> {
        self.check_shape(other.shape())?;
        self.data
            .iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
        Ok(())
    }
    /// Divides every pixel by `n`, `None` if `n` is zero
    pub fn divided_by(mut self, n: usize) -> Option<Self> {
        if n == 0 {
            return None;
        }
        let n = n as f64;
        self.data.iter_mut().for_each(|x| *x /= n);
        Some(self)
    }
}

/// A stack of detector frames of shape (frame, spatial, spectral)
#[derive(Debug, Clone, PartialEq)]
pub struct FrameCube {
    n_frames: usize,
    n_spatial: usize,
    n_spectral: usize,
    data: Vec<f64>,
}
impl FrameCube {
    pub fn new(n_frames: usize, n_spatial: usize, n_spectral: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_frames * n_spatial * n_spectral {
            return Err(FramesError::Length {
                expected: n_frames * n_spatial * n_spectral,
                found: data.len(),
            });
        }
        Ok(Self {
            n_frames,
            n_spatial,
            n_spectral,
            data,
        })
    }
    /// Loads a frame cube from a `.npy` file or from the `imagedata` entry of a `.npz` archive
    pub fn from_path<P: AsRef<Path>>(path: P, layout: FrameLayout) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading {:?}...", path);
        let (shape, data) = read_array(path, "imagedata")?;
        let [n_frames, n_1, n_2] = shape[..] else {
            return Err(FramesError::Dimension {
                expected: 3,
                found: shape.iter().map(|&n| n as u64).collect(),
            });
        };
        let cube = Self::new(n_frames, n_1, n_2, data)?;
        Ok(match layout {
            FrameLayout::Natural => cube,
            FrameLayout::Transposed => cube.transposed(),
        })
    }
    /// Swaps the spatial and spectral axes
    pub fn transposed(self) -> Self {
        let (n_1, n_2) = (self.n_spatial, self.n_spectral);
        let data = self
            .data
            .chunks_exact((n_1 * n_2).max(1))
            .flat_map(|frame| (0..n_2).flat_map(move |j| (0..n_1).map(move |i| frame[i * n_2 + j])))
            .collect();
        Self {
            n_frames: self.n_frames,
            n_spatial: n_2,
            n_spectral: n_1,
            data,
        }
    }
    /// (frame, spatial, spectral) shape
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n_frames, self.n_spatial, self.n_spectral)
    }
    /// (spatial, spectral) shape of a frame
    pub fn frame_shape(&self) -> (usize, usize) {
        (self.n_spatial, self.n_spectral)
    }
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }
    pub fn is_empty(&self) -> bool {
        self.n_frames == 0
    }
    pub fn frame(&self, k: usize) -> &[f64] {
        let size = self.n_spatial * self.n_spectral;
        &self.data[k * size..(k + 1) * size]
    }
    /// Iterator over the frames, each frame flattened in row-major order
    pub fn frames(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.data
            .chunks_exact((self.n_spatial * self.n_spectral).max(1))
            .take(self.n_frames)
    }
    /// The spectrum of frame `k` at spatial row `row`
    pub fn spectrum(&self, k: usize, row: usize) -> &[f64] {
        let start = (k * self.n_spatial + row) * self.n_spectral;
        &self.data[start..start + self.n_spectral]
    }
    /// Subtracts the dark map from every frame
    pub fn subtract_dark(&mut self, dark: &DarkMap) -> Result<()> {
        if dark.shape() != self.frame_shape() {
            return Err(FramesError::Shape {
                expected: dark.shape(),
                found: self.frame_shape(),
            });
        }
        let size = self.n_spatial * self.n_spectral;
        if size == 0 {
            return Ok(());
        }
        self.data.chunks_exact_mut(size).for_each(|frame| {
            frame
                .iter_mut()
                .zip(dark.as_slice())
                .for_each(|(x, d)| *x -= d)
        });
        Ok(())
    }
    /// The sum of all frames
    pub fn sum_frames(&self) -> Image {
        let mut sum = Image::zeros(self.n_spatial, self.n_spectral);
        self.frames().for_each(|frame| {
            sum.data.iter_mut().zip(frame).for_each(|(s, x)| *s += x)
        });
        sum
    }
    /// The average frame, `None` for an empty cube
    pub fn mean_frame(&self) -> Option<Image> {
        self.sum_frames().divided_by(self.n_frames)
    }
    /// The average of each frame
    pub fn frame_means(&self) -> Vec<f64> {
        self.frames()
            .map(|frame| frame.iter().sum::<f64>() / frame.len() as f64)
            .collect()
    }
    /// The variance of each frame
    pub fn frame_variances(&self) -> Vec<f64> {
        self.frames()
            .map(|frame| {
                let n = frame.len() as f64;
                let mean = frame.iter().sum::<f64>() / n;
                frame.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n
            })
            .collect()
    }
    /// Bins `n` consecutive frames together, summing or averaging them
    ///
    /// The frames left over at the end of the cube are dropped.
    /// `None` bins all the frames into one.
    pub fn binning(&self, n: Option<usize>, average: bool) -> Self {
        let n = n.unwrap_or(self.n_frames).max(1);
        let n_binned = self.n_frames / n;
        let size = self.n_spatial * self.n_spectral;
        let mut data = Vec::with_capacity(n_binned * size);
        for group in 0..n_binned {
            let frames: Range<usize> = group * n..(group + 1) * n;
            let mut binned = vec![0f64; size];
            frames.for_each(|k| {
                binned
                    .iter_mut()
                    .zip(self.frame(k))
                    .for_each(|(b, x)| *b += x)
            });
            if average {
                binned.iter_mut().for_each(|b| *b /= n as f64);
            }
            data.extend(binned);
        }
        Self {
            n_frames: n_binned,
            n_spatial: self.n_spatial,
            n_spectral: self.n_spectral,
            data,
        }
    }
    /// Stacks frame cubes along the frame axis
    pub fn concat(cubes: Vec<FrameCube>) -> Result<Self> {
        let mut cubes = cubes.into_iter();
        let mut stack = cubes.next().ok_or(FramesError::EmptyStack)?;
        for cube in cubes {
            if cube.frame_shape() != stack.frame_shape() {
                return Err(FramesError::Shape {
                    expected: stack.frame_shape(),
                    found: cube.frame_shape(),
                });
            }
            stack.n_frames += cube.n_frames;
            stack.data.extend(cube.data);
        }
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n_frames: usize, n_spatial: usize, n_spectral: usize) -> FrameCube {
        let n = n_frames * n_spatial * n_spectral;
        FrameCube::new(n_frames, n_spatial, n_spectral, (0..n).map(|x| x as f64).collect())
            .unwrap()
    }

    #[test]
    fn transpose_swaps_detector_axes() {
        let cube = ramp(2, 3, 4);
        let transposed = cube.clone().transposed();
        assert_eq!(transposed.shape(), (2, 4, 3));
        for k in 0..2 {
            for i in 0..3 {
                for j in 0..4 {
                    assert_eq!(cube.frame(k)[i * 4 + j], transposed.frame(k)[j * 3 + i]);
                }
            }
        }
    }

    #[test]
    fn dark_subtraction_and_mean() {
        let mut cube = FrameCube::new(2, 1, 2, vec![1., 2., 3., 4.]).unwrap();
        let dark = Image::new(1, 2, vec![1., 1.]).unwrap();
        cube.subtract_dark(&dark).unwrap();
        assert_eq!(cube.mean_frame().unwrap().as_slice(), &[1., 2.]);
        assert_eq!(cube.frame_means(), vec![0.5, 2.5]);
        assert_eq!(cube.frame_variances(), vec![0.25, 0.25]);
    }

    #[test]
    fn dark_shape_mismatch() {
        let mut cube = ramp(1, 2, 2);
        let dark = Image::zeros(3, 2);
        assert!(matches!(
            cube.subtract_dark(&dark),
            Err(FramesError::Shape { .. })
        ));
    }

    #[test]
    fn empty_cube_has_no_mean() {
        let cube = FrameCube::new(0, 2, 2, vec![]).unwrap();
        assert!(cube.mean_frame().is_none());
    }

    #[test]
    fn binning_drops_the_tail() {
        let cube = FrameCube::new(5, 1, 1, vec![1., 2., 3., 4., 5.]).unwrap();
        let summed = cube.binning(Some(2), false);
        assert_eq!(summed.shape(), (2, 1, 1));
        assert_eq!(summed.frame(0), &[3.]);
        assert_eq!(summed.frame(1), &[7.]);
        let averaged = cube.binning(None, true);
        assert_eq!(averaged.frame(0), &[3.]);
    }

    #[test]
    fn concat_stacks_frames() {
        let stack = FrameCube::concat(vec![ramp(2, 2, 3), ramp(1, 2, 3)]).unwrap();
        assert_eq!(stack.shape(), (3, 2, 3));
        assert_eq!(stack.spectrum(2, 1), &[3., 4., 5.]);
        assert!(FrameCube::concat(vec![ramp(1, 2, 3), ramp(1, 3, 2)]).is_err());
    }

    #[test]
    fn fortran_order_is_reordered() {
        // 2x3 array [[0,1,2],[3,4,5]] stored column-major
        let data = vec![0., 3., 1., 4., 2., 5.];
        assert_eq!(fortran_to_c(data, &[2, 3]), vec![0., 1., 2., 3., 4., 5.]);
    }

    #[test]
    fn npy_round_trip() {
        let path = std::env::temp_dir().join("glint-drs_frames_npy_round_trip.npy");
        let image = Image::new(2, 3, vec![0., 1., 2., 3., 4., 5.5]).unwrap();
        image.to_path(&path).unwrap();
        assert_eq!(Image::from_path(&path).unwrap(), image);

        write_array(&path, &[2, 2, 3], &(0..12).map(|x| x as f64).collect::<Vec<_>>()).unwrap();
        let cube = FrameCube::from_path(&path, FrameLayout::Transposed).unwrap();
        assert_eq!(cube.shape(), (2, 3, 2));
        assert_eq!(cube.spectrum(1, 2), &[8., 11.]);
        assert!(matches!(
            Image::from_path(&path),
            Err(FramesError::Dimension { expected: 2, .. })
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let path = std::env::temp_dir().join("glint-drs_does_not_exist.npy");
        assert!(matches!(
            FrameCube::from_path(path, FrameLayout::Natural),
            Err(FramesError::Read { .. })
        ));
    }
}
