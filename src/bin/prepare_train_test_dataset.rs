//! prepare_train_test_dataset - split the raw car images into train/test class folders
//!
//! Reads the labels table and places every image at
//! `<output_data_folder>/<subset>/<class>/<img_name>`. The whole step is skipped
//! when `<output_data_folder>/train` already exists.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use vehicle_prep::{split_dataset_from_path, PrepConfig, SplitOptions, SplitOutcome};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory holding all the car images, e.g. `data/car_ims/`.
    data_folder: PathBuf,
    /// CSV file with `img_name`, `class` and `subset` columns.
    labels: PathBuf,
    /// Directory that receives the train/test split, e.g. `data/car_ims_v1/`.
    output_data_folder: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = PrepConfig::load()?;
    let ui = ui::Ui::from_mode(&cfg.ui, std::io::stderr().is_terminal());

    let options = SplitOptions {
        link_mode: cfg.link_mode,
    };
    let outcome = {
        let _stage = ui.stage("Split images");
        split_dataset_from_path(
            &args.data_folder,
            &args.labels,
            &args.output_data_folder,
            &options,
        )?
    };
    match outcome {
        SplitOutcome::Completed { files } => {
            println!(
                "{} images placed under {}",
                files,
                args.output_data_folder.display()
            );
        }
        SplitOutcome::Skipped => println!("images already split"),
    }
    Ok(())
}
