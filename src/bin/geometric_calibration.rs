//! Track geometry calibration
//!
//! Fits a Gaussian to the cross-track profile of every output and spectral
//! channel of the averaged science frames and saves the coefficients
//! (amplitude, position, width, offset) into `pattern_coeff.npy`.
//!
//! The science frames must have no fringe: either out of the coherence
//! envelope or with a phase varying fast enough to blur the fringes out.

use std::{path::PathBuf, time::Instant};

use glint_drs::{
    calibration::{self, CalibrationError, COEFF_POSITION_POLY, COEFF_WIDTH_POLY, PATTERN_COEFF},
    dark::SUPERDARK,
    frames,
    lm::LmConfig,
    spectral,
    tracks::{GLINT_LABELS, GLINT_TRACK_ENDS},
    DarkMap, FrameLayout, TrackLayout,
};
use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "glint-geometric-calibration",
    about = "GLINT position and width of the outputs"
)]
struct Opt {
    /// Path to the data folder
    data_path: PathBuf,
    /// Output folder [default: the data folder]
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Average dark [default: `superdark.npy` in the output folder]
    #[structopt(long)]
    dark: Option<PathBuf>,
    /// Science files glob pattern, files with `dark` in their name are left out
    #[structopt(long, default_value = "*.npy")]
    pattern: String,
    /// Maximum number of science files
    #[structopt(long, default_value = "1000")]
    max_files: usize,
    /// Row of the top-most track
    #[structopt(long)]
    top: Option<f64>,
    /// Row of the bottom-most track
    #[structopt(long)]
    bottom: Option<f64>,
    /// Number of tracks
    #[structopt(long, default_value = "16")]
    n_tracks: usize,
    /// The files are stored as (frame, spatial, spectral) arrays
    #[structopt(long)]
    natural: bool,
    /// Maximum number of iterations of the Gaussian fits
    #[structopt(long, default_value = "200")]
    max_iterations: usize,
    /// Fits polynomials to the positions and widths from this spectral channel ...
    #[structopt(long)]
    poly_start: Option<usize>,
    /// ... to this one (excluded)
    #[structopt(long, default_value = "96")]
    poly_end: usize,
    /// Degree of the position and width polynomials
    #[structopt(long, default_value = "4")]
    poly_degree: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();
    let output = opt.output.clone().unwrap_or_else(|| opt.data_path.clone());
    let layout = if opt.natural {
        FrameLayout::Natural
    } else {
        FrameLayout::Transposed
    };

    let data_files: Vec<PathBuf> = frames::list_files(&opt.data_path, &opt.pattern)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .map_or(true, |name| !name.to_string_lossy().contains("dark"))
        })
        .take(opt.max_files)
        .collect();
    if data_files.is_empty() {
        return Err(CalibrationError::EmptyDataList.into());
    }
    println!("Found {} science files", data_files.len());

    let dark = DarkMap::from_path(opt.dark.unwrap_or_else(|| output.join(SUPERDARK)))?;

    println!("Averaging frames");
    let now = Instant::now();
    let pb = ProgressBar::new(data_files.len() as u64);
    let average =
        calibration::average_frames(data_files.par_iter().progress_with(pb), &dark, layout)?;
    println!(
        "Averaged {} frames in {}s ({} files skipped)",
        average.n_frames,
        now.elapsed().as_secs(),
        average.failures.len()
    );

    let (top, bottom) = GLINT_TRACK_ENDS;
    let mut tracks = TrackLayout::from_ends(
        opt.top.unwrap_or(top),
        opt.bottom.unwrap_or(bottom),
        opt.n_tracks,
    )?;
    if opt.n_tracks == GLINT_LABELS.len() {
        tracks = tracks.with_labels(&GLINT_LABELS)?;
    }
    let slices = tracks.slices(&average.image)?;

    println!("Determine position and width of the outputs");
    let now = Instant::now();
    let config = LmConfig {
        max_iterations: opt.max_iterations,
        ..Default::default()
    };
    let calibration = calibration::calibrate(&slices, &tracks, &config)?;
    println!(
        "{} fits in {}ms, {} failed",
        slices.n_channels() * slices.n_tracks(),
        now.elapsed().as_millis(),
        calibration.failures().len()
    );

    println!("{:>4} {:>10} {:>10}", "", "position", "width");
    for (track, label) in tracks.labels().iter().enumerate() {
        match calibration.mean_geometry(track) {
            Some((position, width)) => {
                println!("{:>4} {:>10.3} {:>10.3}", label, position, width)
            }
            None => println!("{:>4} {:>10} {:>10}", label, "-", "-"),
        }
    }

    calibration.to_path(output.join(PATTERN_COEFF))?;

    if let Some(start) = opt.poly_start {
        let channels = start..opt.poly_end;
        spectral::save_polynomials(
            output.join(COEFF_POSITION_POLY),
            &calibration.position_polynomials(channels.clone(), opt.poly_degree)?,
        )?;
        spectral::save_polynomials(
            output.join(COEFF_WIDTH_POLY),
            &calibration.width_polynomials(channels, opt.poly_degree)?,
        )?;
    }

    Ok(())
}
