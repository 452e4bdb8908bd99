//! Science frames explorer
//!
//! Stacks the dark subtracted frames of a data folder, prints the flux of
//! each output in a spectral band and writes the flux time series to a CSV file.

use std::{path::PathBuf, time::Instant};

use glint_drs::{
    dark::{DarkConfig, SUPERDARK},
    explorer::{self, DEFAULT_FPS},
    frames,
    spectral::WavelengthCalibration,
    DarkMap, Explorer, FrameLayout, Output,
};
use strum::IntoEnumIterator;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "glint-explorer", about = "GLINT science frames quick look")]
struct Opt {
    /// Path to the data folder
    data_path: PathBuf,
    /// Data files glob pattern
    #[structopt(long, default_value = "*.npy")]
    pattern: String,
    /// Index of the first data file
    #[structopt(long, default_value = "0")]
    first: usize,
    /// Number of data files
    #[structopt(short, long, default_value = "1")]
    n_files: usize,
    /// Step between data files
    #[structopt(long, default_value = "1")]
    step: usize,
    /// Average dark [default: `superdark.npy` in the data folder]
    #[structopt(long)]
    dark: Option<PathBuf>,
    /// Dark files glob pattern, used when the average dark is missing
    #[structopt(long, default_value = "*dark*")]
    dark_pattern: String,
    /// No dark subtraction
    #[structopt(long)]
    no_noise: bool,
    /// Pixel to wavelength coefficients
    #[structopt(long)]
    wavelength: Option<PathBuf>,
    /// Camera frame rate [Hz]
    #[structopt(long, default_value = "1400")]
    fps: f64,
    /// First spectral channel of the flux band
    #[structopt(long, default_value = "45")]
    band_start: usize,
    /// Last spectral channel of the flux band (excluded)
    #[structopt(long, default_value = "57")]
    band_end: usize,
    /// Bins consecutive frames together
    #[structopt(short, long)]
    binning: Option<usize>,
    /// Averages instead of summing the binned frames
    #[structopt(long)]
    average: bool,
    /// The files are stored as (frame, spatial, spectral) arrays
    #[structopt(long)]
    natural: bool,
    /// CSV file for the band flux time series
    #[structopt(long, default_value = "band_flux.csv")]
    csv: PathBuf,
}

fn mean_std(x: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    let var = x.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();
    let layout = if opt.natural {
        FrameLayout::Natural
    } else {
        FrameLayout::Transposed
    };

    let data_files: Vec<PathBuf> = frames::list_files(&opt.data_path, &opt.pattern)?
        .into_iter()
        .skip(opt.first)
        .step_by(opt.step.max(1))
        .take(opt.n_files)
        .collect();

    let dark = if opt.no_noise {
        println!("No-noise data");
        let (n_spatial, n_spectral) = frames::DETECTOR_SHAPE;
        DarkMap::zeros(n_spatial, n_spectral)
    } else {
        let dark_files = frames::list_files(&opt.data_path, &opt.dark_pattern)?;
        let config = DarkConfig {
            layout,
            ..Default::default()
        };
        explorer::dark_or_fallback(
            opt.dark
                .clone()
                .unwrap_or_else(|| opt.data_path.join(SUPERDARK)),
            &dark_files,
            &config,
        )?
    };

    let now = Instant::now();
    let mut explorer = Explorer::load(&data_files, &dark, layout)?
        .fps(if opt.fps > 0. { opt.fps } else { DEFAULT_FPS });
    if opt.binning.is_some() {
        explorer = explorer.binned(opt.binning, opt.average);
    }
    println!(
        "Loaded {} frames in {}ms",
        explorer.n_frames(),
        now.elapsed().as_millis()
    );

    let calibration = opt.wavelength.as_ref().and_then(|path| {
        WavelengthCalibration::from_path(path)
            .map_err(|e| log::warn!("No wavelength calibration found ({}), keep pixel scale", e))
            .ok()
    });
    let unit = if calibration.is_some() { "nm" } else { "px" };
    let band = opt.band_start..opt.band_end;
    let wavelengths = explorer.wavelengths(calibration.as_ref())?;

    println!("Flux in the spectral band {:?}", band);
    for (output, scale) in &wavelengths {
        let flux = explorer.band_flux(*output, band.clone())?;
        let (mean, std) = mean_std(&flux);
        println!(
            " - {:3}: [{:.1},{:.1}]{} {:>12.3} +/- {:.3}",
            output.to_string(),
            scale[band.start],
            scale[band.end - 1],
            unit,
            mean,
            std
        );
    }

    println!("Null depth estimates");
    for null in Output::nulls() {
        let (Some(ratio), Some(histogram)) = (
            explorer.null_ratio(null, band.clone())?,
            explorer.null_ratio_histogram(null, band.clone())?,
        ) else {
            continue;
        };
        let ratio: Vec<f64> = ratio.into_iter().flatten().collect();
        let (mean, std) = mean_std(&ratio);
        let mode = histogram
            .counts()
            .iter()
            .zip(histogram.centers())
            .max_by_key(|&(&count, _)| count)
            .map_or(f64::NAN, |(_, center)| center);
        println!(
            " - {:3} {:?}: {:.4} +/- {:.4}, mode at {:.3} ({} of {} frames in [{},{}])",
            null.to_string(),
            null.baseline().unwrap_or_default(),
            mean,
            std,
            mode,
            histogram.total(),
            ratio.len(),
            histogram.grid().low(),
            histogram.grid().high()
        );
    }

    explorer.to_csv(&opt.csv, band)?;
    println!(
        "Band flux of {} outputs saved to {:?}",
        Output::iter().count(),
        opt.csv
    );

    Ok(())
}
