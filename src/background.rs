//! Background removal over a split dataset tree.
//!
//! Every image under `<input>/<subset>/<class>/` is run through the detector,
//! cropped to the selected vehicle region and written to the same relative
//! location under the output root. Images are handled one at a time.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use walkdir::WalkDir;

use crate::detect::DetectorBackend;
use crate::region::{crop_to_region, CropBox, VehicleRegionSelector};

/// Extensions the driver will decode. Anything else is skipped.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemovalStats {
    /// Images cropped and written.
    pub processed: usize,
    /// Non-image files ignored.
    pub skipped: usize,
    /// Images written uncropped because no vehicle was found.
    pub full_frame: usize,
}

/// Outcome for a single image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CroppedImage {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub region: CropBox,
    pub full_frame: bool,
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Collect image files under `root`, sorted by path.
pub fn collect_images(root: &Path) -> Result<(Vec<PathBuf>, usize)> {
    if !root.is_dir() {
        return Err(anyhow!("input folder {} is not a directory", root.display()));
    }
    let mut images = Vec::new();
    let mut skipped = 0usize;
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("failed to walk input folder {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if is_supported_image(entry.path()) {
            images.push(entry.into_path());
        } else {
            log::debug!("skipping non-image file {}", entry.path().display());
            skipped += 1;
        }
    }
    Ok((images, skipped))
}

/// Mirror `source` into `output` using its last two parent folders.
///
/// `<anything>/<subset>/<class>/<file>` maps to `<output>/<subset>/<class>/<file>`.
pub fn mirrored_destination(input_root: &Path, source: &Path, output: &Path) -> Result<PathBuf> {
    let relative = source.strip_prefix(input_root).with_context(|| {
        format!(
            "{} is not inside input folder {}",
            source.display(),
            input_root.display()
        )
    })?;
    let parts: Vec<_> = relative.iter().collect();
    if parts.len() < 3 {
        return Err(anyhow!(
            "{} is not inside a <subset>/<class> folder under {}",
            source.display(),
            input_root.display()
        ));
    }
    let n = parts.len();
    Ok(output.join(parts[n - 3]).join(parts[n - 2]).join(parts[n - 1]))
}

/// Detector-driven cropper. Owns the detector handle for the whole run.
pub struct BackgroundRemover<D: DetectorBackend> {
    detector: D,
    selector: VehicleRegionSelector,
}

impl<D: DetectorBackend> BackgroundRemover<D> {
    pub fn new(detector: D, selector: VehicleRegionSelector) -> Self {
        Self { detector, selector }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn into_detector(self) -> D {
        self.detector
    }

    /// Crop one image and write it to `destination`.
    pub fn process_image(&mut self, source: &Path, destination: &Path) -> Result<CroppedImage> {
        let image = image::open(source)
            .with_context(|| format!("failed to decode image {}", source.display()))?;
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();

        let result = self
            .detector
            .detect(&rgb)
            .with_context(|| format!("detector failed on {}", source.display()))?;
        let vehicle = self.selector.best_vehicle(&result, width, height);
        let full_frame = vehicle.is_none();
        let region = match vehicle {
            Some((_, crop)) => crop,
            None => CropBox::full(width, height),
        };
        log::debug!(
            "{}: {} detections, crop {:?}{}",
            source.display(),
            result.len(),
            region.as_tuple(),
            if full_frame { " (full frame)" } else { "" }
        );

        let cropped = crop_to_region(&image, region);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        cropped
            .save(destination)
            .with_context(|| format!("failed to write {}", destination.display()))?;

        Ok(CroppedImage {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            region,
            full_frame,
        })
    }

    /// Process every image under `input`, writing the mirrored tree to `output`.
    ///
    /// `on_image` is called after each image is written.
    pub fn run<F>(&mut self, input: &Path, output: &Path, mut on_image: F) -> Result<RemovalStats>
    where
        F: FnMut(&CroppedImage, usize),
    {
        let (images, skipped) = collect_images(input)?;
        fs::create_dir_all(output)
            .with_context(|| format!("failed to create output folder {}", output.display()))?;
        log::info!(
            "removing background from {} images in {} with detector '{}'",
            images.len(),
            input.display(),
            self.detector.name()
        );

        let mut stats = RemovalStats {
            skipped,
            ..RemovalStats::default()
        };
        for source in &images {
            let destination = mirrored_destination(input, source, output)?;
            let cropped = self.process_image(source, &destination)?;
            stats.processed += 1;
            if cropped.full_frame {
                stats.full_frame += 1;
            }
            on_image(&cropped, images.len());
        }

        log::info!(
            "cropped {} images ({} full frame, {} skipped)",
            stats.processed,
            stats.full_frame,
            stats.skipped
        );
        Ok(stats)
    }
}
