//! Dark reduction
//!
//! Averages the dark files of a data folder into `superdark.npy` and saves
//! the histogram of the zero-mean dark current into `hist_dark.pkl`.

use std::{path::PathBuf, time::Instant};

use glint_drs::{
    dark::{self, DarkConfig},
    frames, AcquisitionDate, BinGrid, FrameLayout,
};
use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "glint-dark", about = "GLINT average dark and dark current histogram")]
struct Opt {
    /// Path to the data folder
    data_path: PathBuf,
    /// Acquisition date (YYYY-MM-DD)
    #[structopt(short, long)]
    date: AcquisitionDate,
    /// Output folder [default: the data folder]
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Dark files glob pattern
    #[structopt(long, default_value = "*dark*")]
    pattern: String,
    /// Histogram lower bound [ADU]
    #[structopt(long, default_value = "-2800", allow_hyphen_values = true)]
    low: f64,
    /// Histogram upper bound [ADU]
    #[structopt(long, default_value = "13700", allow_hyphen_values = true)]
    high: f64,
    /// Histogram number of bins
    #[structopt(long, default_value = "1000")]
    bins: usize,
    /// The files are stored as (frame, spatial, spectral) arrays
    #[structopt(long)]
    natural: bool,
    /// Reports per-frame statistics of the darks
    #[structopt(short, long)]
    monitor: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let config = DarkConfig {
        grid: BinGrid::new(opt.low, opt.high, opt.bins)?,
        layout: if opt.natural {
            FrameLayout::Natural
        } else {
            FrameLayout::Transposed
        },
        monitor: opt.monitor,
        ..Default::default()
    };

    let dark_files = frames::list_files(&opt.data_path, &opt.pattern)?;
    println!("Found {} dark files", dark_files.len());

    let now = Instant::now();
    let pb = ProgressBar::new(dark_files.len() as u64);
    let reduction = dark::aggregate(dark_files.par_iter().progress_with(pb), &config)?;
    println!(
        "Reduced {} frames in {}s",
        reduction.n_frames,
        now.elapsed().as_secs()
    );
    for failure in &reduction.failures {
        println!(" - skipped {:?}: {}", failure.path, failure.reason);
    }
    if reduction.average.is_none() {
        println!("No dark frame: the average dark is not saved");
    }

    if let Some(monitor) = &reduction.monitor {
        for (name, histogram) in [
            ("average", monitor.mean_histogram()?),
            ("variance", monitor.variance_histogram()?),
        ] {
            println!(
                "Dark {} per frame: [{:.3},{:.3}] in {} bins, mode at {:.3}",
                name,
                histogram.grid().low(),
                histogram.grid().high(),
                histogram.grid().n_bins(),
                histogram
                    .counts()
                    .iter()
                    .zip(histogram.centers())
                    .max_by_key(|&(&count, _)| count)
                    .map_or(f64::NAN, |(_, center)| center)
            );
        }
    }

    let output = opt.output.unwrap_or(opt.data_path);
    reduction.save(&output, &opt.date)?;

    Ok(())
}
