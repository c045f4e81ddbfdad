//! remove_background - crop every image of a split dataset to its main vehicle
//!
//! The detector is created once from the runtime config and used for every
//! image; output mirrors the `<subset>/<class>/` layout of the input.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use vehicle_prep::{BackgroundRemover, PrepConfig, VehicleRegionSelector};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Train/test split produced by prepare_train_test_dataset, e.g. `data/car_ims_v1/`.
    data_folder: PathBuf,
    /// Directory that receives the cropped images, e.g. `data/car_ims_v2/`.
    output_data_folder: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = PrepConfig::load()?;
    let ui = ui::Ui::from_mode(&cfg.ui, std::io::stderr().is_terminal());

    let detector = {
        let _stage = ui.stage("Load detector");
        cfg.detector.build_vehicle_detector()?
    };
    log::info!(
        "detector '{}', vehicle classes {:?}",
        detector.name(),
        cfg.vehicle_classes.ids()
    );

    let selector = VehicleRegionSelector::new(cfg.vehicle_classes.clone());
    let mut remover = BackgroundRemover::new(detector, selector);

    let stats = {
        let _stage = ui.stage("Crop images");
        let mut progress = None;
        let stats = remover.run(&args.data_folder, &args.output_data_folder, |img, total| {
            let bar = progress.get_or_insert_with(|| ui.progress(total as u64));
            bar.set_message(img.destination.display().to_string());
            bar.inc(1);
        })?;
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }
        stats
    };

    println!(
        "{} images cropped into {} ({} without a vehicle, {} non-image files skipped)",
        stats.processed,
        args.output_data_folder.display(),
        stats.full_frame,
        stats.skipped
    );
    Ok(())
}
