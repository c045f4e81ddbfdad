//! Train/test split of the raw image folder.
//!
//! Produces `<output>/<subset>/<class>/<img_name>` for every row of the labels
//! table. The whole step is skipped when `<output>/train` already exists.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

/// Folder whose presence marks a completed split.
pub const TRAIN_SUBSET: &str = "train";

/// One row of the labels table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LabelRow {
    pub img_name: String,
    pub class: String,
    pub subset: String,
}

impl LabelRow {
    /// Path of this image relative to the output root.
    pub fn relative_destination(&self) -> PathBuf {
        Path::new(&self.subset).join(&self.class).join(&self.img_name)
    }

    fn validate(&self, line: u64) -> Result<()> {
        for (column, value) in [
            ("img_name", &self.img_name),
            ("class", &self.class),
            ("subset", &self.subset),
        ] {
            if !is_single_component(value) {
                bail!(
                    "labels row {}: column '{}' value {:?} is not a plain file or folder name",
                    line,
                    column,
                    value
                );
            }
        }
        Ok(())
    }
}

fn is_single_component(value: &str) -> bool {
    if value.trim().is_empty() {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !value.contains(['/', '\\'])
}

/// Parsed labels table.
#[derive(Clone, Debug, Default)]
pub struct LabelsTable {
    rows: Vec<LabelRow>,
}

impl LabelsTable {
    pub fn from_path(path: &Path) -> Result<Self> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_path(path)
            .with_context(|| format!("failed to open labels table {}", path.display()))?;
        Self::from_csv(reader).with_context(|| format!("invalid labels table {}", path.display()))
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);
        Self::from_csv(reader)
    }

    fn from_csv<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let headers = reader.headers().context("failed to read CSV headers")?.clone();
        for column in ["img_name", "class", "subset"] {
            if !headers.iter().any(|h| h == column) {
                bail!("labels table is missing required column '{}'", column);
            }
        }

        let mut rows = Vec::new();
        let mut record = csv::StringRecord::new();
        while reader
            .read_record(&mut record)
            .context("failed to read labels row")?
        {
            // Line where the record starts; quoted fields may span several.
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let row: LabelRow = record
                .deserialize(Some(&headers))
                .with_context(|| format!("failed to parse labels row {}", line))?;
            row.validate(line)?;
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[LabelRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct subsets, in first-seen order.
    pub fn subsets(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .map(|r| r.subset.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }
}

/// How images are placed into the split tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkMode {
    /// Hard link; no extra disk space, source and destination share an inode.
    #[default]
    HardLink,
    /// Full byte copy; works across filesystems.
    Copy,
}

impl LinkMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hardlink" | "hard_link" | "link" => Ok(Self::HardLink),
            "copy" => Ok(Self::Copy),
            other => Err(anyhow!(
                "unknown link mode '{}' (expected hardlink or copy)",
                other
            )),
        }
    }

    fn place(self, src: &Path, dest: &Path) -> Result<()> {
        if dest.exists() {
            fs::remove_file(dest)
                .with_context(|| format!("failed to replace {}", dest.display()))?;
        }
        match self {
            Self::HardLink => fs::hard_link(src, dest).with_context(|| {
                format!("failed to link {} -> {}", src.display(), dest.display())
            }),
            Self::Copy => fs::copy(src, dest).map(|_| ()).with_context(|| {
                format!("failed to copy {} -> {}", src.display(), dest.display())
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SplitOptions {
    pub link_mode: LinkMode,
}

/// What `split_dataset` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitOutcome {
    /// `<output>/train` already existed; nothing was touched.
    Skipped,
    Completed { files: usize },
}

/// Place every image listed in `labels` under `output`.
///
/// Subset and class directories are created on first use. A missing source
/// image aborts the run; files placed before the failure stay on disk.
pub fn split_dataset(
    data_folder: &Path,
    labels: &LabelsTable,
    output: &Path,
    options: &SplitOptions,
) -> Result<SplitOutcome> {
    fs::create_dir_all(output)
        .with_context(|| format!("failed to create output folder {}", output.display()))?;

    if output.join(TRAIN_SUBSET).exists() {
        log::info!(
            "{} already exists, skipping split",
            output.join(TRAIN_SUBSET).display()
        );
        return Ok(SplitOutcome::Skipped);
    }

    log::info!(
        "splitting {} images into {} ({:?})",
        labels.len(),
        output.display(),
        options.link_mode
    );

    let mut created: HashSet<PathBuf> = HashSet::new();
    let mut files = 0usize;
    for row in labels.rows() {
        let class_folder = output.join(&row.subset).join(&row.class);
        if !created.contains(&class_folder) {
            fs::create_dir_all(&class_folder)
                .with_context(|| format!("failed to create {}", class_folder.display()))?;
            created.insert(class_folder.clone());
        }

        let src = data_folder.join(&row.img_name);
        if !src.is_file() {
            bail!("image {} listed in labels table not found", src.display());
        }
        let dest = class_folder.join(&row.img_name);
        options.link_mode.place(&src, &dest)?;
        log::debug!("{} -> {}", src.display(), dest.display());
        files += 1;
    }

    log::info!("placed {} images in {} class folders", files, created.len());
    Ok(SplitOutcome::Completed { files })
}

/// Read the labels table at `labels_path` and split.
pub fn split_dataset_from_path(
    data_folder: &Path,
    labels_path: &Path,
    output: &Path,
    options: &SplitOptions,
) -> Result<SplitOutcome> {
    if output.join(TRAIN_SUBSET).exists() {
        log::info!("{} already split", output.display());
        return Ok(SplitOutcome::Skipped);
    }
    let labels = LabelsTable::from_path(labels_path)?;
    log::info!(
        "{} labelled images across subsets {:?}",
        labels.len(),
        labels.subsets()
    );
    split_dataset(data_folder, &labels, output, options)
}
