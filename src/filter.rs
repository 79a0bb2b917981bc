//! Removal of image sets in which the object is not visible.
//!
//! Every variation is judged by the mean brightness of its reference view (the top view by
//! default). An empty box renders close to uniformly bright, so a reference image above the upper
//! threshold is unlikely to show the object. Thresholds come either from a fixed value or from
//! two calibration renders: one of an empty box and one of a box with an object.
//!
//! A rejected variation is removed from every view, not only the reference view, so the views
//! of the dataset stay aligned.

use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use thiserror::Error;
use walkdir::WalkDir;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::OutputLayout;
use crate::orchestrator::view_dir;
use crate::progress_bar;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("could not read reference image {path}: {source}")]
    Reference {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("could not traverse output directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Mean of the 8 bit grayscale conversion over all pixels.
pub fn image_brightness(image: &image::DynamicImage) -> f64 {
    let gray = image.to_luma8();
    let n = gray.pixels().len();
    if n == 0 {
        return 0.0;
    }
    gray.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n as f64
}

pub fn mean_brightness(path: &Path) -> Result<f64, image::ImageError> {
    Ok(image_brightness(&image::open(path)?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    TooBright,
    TooDark,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Verdict::Accepted => "accepted",
            Verdict::TooBright => "too bright",
            Verdict::TooDark => "too dark",
        };
        write!(f, "{}", s)
    }
}

/// Acceptance band for reference brightness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub upper: f64,
    pub lower: Option<f64>,
}

impl Thresholds {
    pub fn fixed(upper: f64) -> Self {
        Thresholds { upper, lower: None }
    }

    /// `upper = empty - margin`, `lower = object + margin`.
    pub fn from_means(empty: f64, object: Option<f64>, margin: f64) -> Self {
        Thresholds {
            upper: empty - margin,
            lower: object.map(|o| o + margin),
        }
    }

    /// Thresholds from reference renders of an empty enclosure and, optionally, an enclosure
    /// with an object.
    pub fn calibrate(
        empty_reference: &Path,
        object_reference: Option<&Path>,
        margin: f64,
    ) -> Result<Self, FilterError> {
        let read = |path: &Path| {
            mean_brightness(path).map_err(|source| FilterError::Reference {
                path: path.to_path_buf(),
                source,
            })
        };
        let empty = read(empty_reference)?;
        let object = match object_reference {
            Some(path) => Some(read(path)?),
            None => None,
        };
        let thresholds = Thresholds::from_means(empty, object, margin);
        log::info!(
            "calibrated thresholds: empty {:.1}, object {}, upper {:.1}, lower {}",
            empty,
            object.map(|o| format!("{:.1}", o)).unwrap_or_else(|| "-".to_string()),
            thresholds.upper,
            thresholds
                .lower
                .map(|l| format!("{:.1}", l))
                .unwrap_or_else(|| "-".to_string())
        );
        Ok(thresholds)
    }

    pub fn verdict(&self, brightness: f64) -> Verdict {
        if brightness > self.upper {
            Verdict::TooBright
        } else if self.lower.map(|l| brightness < l).unwrap_or(false) {
            Verdict::TooDark
        } else {
            Verdict::Accepted
        }
    }
}

/// A reference view image of one variation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub category: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrightnessRecord {
    pub image: ReferenceImage,
    pub brightness: f64,
}

fn sorted_entries(dir: &Path) -> Result<Vec<walkdir::DirEntry>, FilterError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        entries.push(entry?);
    }
    Ok(entries)
}

fn sorted_dirs(dir: &Path) -> Result<Vec<String>, FilterError> {
    Ok(sorted_entries(dir)?
        .into_iter()
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect())
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("png"))
        .unwrap_or(false)
}

/// Categories present in the output tree for `reference_view`.
pub fn categories(output: &Path, layout: OutputLayout, reference_view: &str) -> Result<Vec<String>, FilterError> {
    match layout {
        OutputLayout::ViewMajor => sorted_dirs(&output.join(reference_view)),
        OutputLayout::CategoryMajor => Ok(sorted_dirs(output)?
            .into_iter()
            .filter(|c| output.join(c).join(reference_view).is_dir())
            .collect()),
    }
}

/// Every PNG of the reference view, sorted by category and file name.
pub fn reference_images(
    output: &Path,
    layout: OutputLayout,
    reference_view: &str,
) -> Result<Vec<ReferenceImage>, FilterError> {
    let mut images = Vec::new();
    for category in categories(output, layout, reference_view)? {
        let dir = view_dir(output, layout, reference_view, &category);
        for entry in sorted_entries(&dir)? {
            if entry.file_type().is_file() && is_png(entry.path()) {
                images.push(ReferenceImage {
                    category: category.clone(),
                    path: entry.path().to_path_buf(),
                });
            }
        }
    }
    Ok(images)
}

/// Directories of all other views of `category`.
pub fn sibling_view_dirs(
    output: &Path,
    layout: OutputLayout,
    reference_view: &str,
    category: &str,
) -> Result<Vec<PathBuf>, FilterError> {
    let views = match layout {
        OutputLayout::ViewMajor => sorted_dirs(output)?,
        OutputLayout::CategoryMajor => sorted_dirs(&output.join(category))?,
    };
    Ok(views
        .into_iter()
        .filter(|v| v != reference_view)
        .map(|v| view_dir(output, layout, &v, category))
        .filter(|d| d.is_dir())
        .collect())
}

/// Brightness of every image. Unreadable images are logged and left out.
pub fn measure(images: &[ReferenceImage], verbose: bool) -> Vec<BrightnessRecord> {
    images
        .par_iter()
        .progress_with(progress_bar(images.len() as u64, "Measuring brightness", verbose))
        .filter_map(|image| match mean_brightness(&image.path) {
            Ok(brightness) => Some(BrightnessRecord {
                image: image.clone(),
                brightness,
            }),
            Err(e) => {
                log::warn!("error processing {}: {}", image.path.display(), e);
                None
            }
        })
        .collect()
}

/// Summary statistics of reference brightness.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    /// Images at evenly spaced quantiles, as `(quantile, record)`.
    pub samples: Vec<(f64, BrightnessRecord)>,
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Images:  {}", self.count)?;
        writeln!(f, "Min:     {:.2}", self.min)?;
        writeln!(f, "Max:     {:.2}", self.max)?;
        writeln!(f, "Mean:    {:.2}", self.mean)?;
        write!(f, "Median:  {:.2}", self.median)?;
        for (q, record) in self.samples.iter() {
            write!(
                f,
                "\n  q{:.2}  {:.2}  {}",
                q,
                record.brightness,
                record.image.path.display()
            )?;
        }
        Ok(())
    }
}

/// Statistics over `records` with `samples` quantile images. `None` if there are no records.
pub fn analyze(records: &[BrightnessRecord], samples: usize) -> Option<Distribution> {
    if records.is_empty() {
        return None;
    }
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| {
        a.brightness
            .partial_cmp(&b.brightness)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2].brightness
    } else {
        (sorted[n / 2 - 1].brightness + sorted[n / 2].brightness) / 2.0
    };
    let quantiles = (0..samples)
        .map(|i| {
            let q = if samples == 1 {
                0.5
            } else {
                i as f64 / (samples - 1) as f64
            };
            let index = ((n - 1) as f64 * q).round() as usize;
            (q, sorted[index].clone())
        })
        .collect();
    Some(Distribution {
        count: n,
        min: sorted[0].brightness,
        max: sorted[n - 1].brightness,
        mean: sorted.iter().map(|r| r.brightness).sum::<f64>() / n as f64,
        median,
        samples: quantiles,
    })
}

#[derive(Debug, Clone)]
pub struct FilterOptions {
    pub layout: OutputLayout,
    pub reference_view: String,
    /// Log decisions without deleting anything.
    pub dry_run: bool,
    pub verbose: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        FilterOptions {
            layout: OutputLayout::ViewMajor,
            reference_view: "top".to_string(),
            dry_run: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub examined: usize,
    pub accepted: usize,
    pub too_bright: usize,
    pub too_dark: usize,
    /// Files removed, or that would be removed in a dry run.
    pub deleted_files: usize,
    /// Files that could not be removed.
    pub failed_files: usize,
}

impl std::fmt::Display for FilterReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Examined:    {}", self.examined)?;
        writeln!(f, "Accepted:    {}", self.accepted)?;
        writeln!(f, "Too bright:  {}", self.too_bright)?;
        writeln!(f, "Too dark:    {}", self.too_dark)?;
        writeln!(f, "Deleted:     {}", self.deleted_files)?;
        write!(f, "Not deleted: {}", self.failed_files)
    }
}

fn remove(path: &Path, dry_run: bool) -> io::Result<bool> {
    if dry_run {
        return Ok(path.exists());
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Judge every reference image in `output` and delete rejected variations from every view.
///
/// The other views of a rejected variation are removed before its reference image. If one of
/// them cannot be removed the reference image is kept, so a later pass finds the set again.
pub fn filter_dataset(
    output: &Path,
    thresholds: &Thresholds,
    options: &FilterOptions,
) -> Result<FilterReport, FilterError> {
    let images = reference_images(output, options.layout, &options.reference_view)?;
    let records = measure(&images, options.verbose);
    let mut report = FilterReport {
        examined: records.len(),
        ..Default::default()
    };

    let mut siblings = BTreeMap::new();
    for record in records.iter() {
        if !siblings.contains_key(&record.image.category) {
            let dirs = sibling_view_dirs(
                output,
                options.layout,
                &options.reference_view,
                &record.image.category,
            )?;
            siblings.insert(record.image.category.clone(), dirs);
        }
    }

    for record in records.iter() {
        let verdict = thresholds.verdict(record.brightness);
        match verdict {
            Verdict::Accepted => {
                report.accepted += 1;
                log::debug!(
                    "keeping {}, average brightness {:.1}",
                    record.image.path.display(),
                    record.brightness
                );
                continue;
            }
            Verdict::TooBright => report.too_bright += 1,
            Verdict::TooDark => report.too_dark += 1,
        }

        let mut targets = Vec::new();
        if let (Some(name), Some(dirs)) = (
            record.image.path.file_name(),
            siblings.get(&record.image.category),
        ) {
            targets.extend(dirs.iter().map(|dir| dir.join(name)));
        }
        targets.push(record.image.path.clone());

        let reference = targets.len() - 1;
        let mut complete = true;
        for (i, path) in targets.iter().enumerate() {
            if i == reference && !complete {
                log::warn!(
                    "keeping {}, other views of the set could not be deleted",
                    path.display()
                );
                break;
            }
            log::info!(
                "{} {}, average brightness {:.1} ({})",
                if options.dry_run { "would delete" } else { "deleting" },
                path.display(),
                record.brightness,
                verdict
            );
            match remove(path, options.dry_run) {
                Ok(true) => report.deleted_files += 1,
                Ok(false) => (),
                Err(e) => {
                    log::error!("could not delete {}: {}", path.display(), e);
                    report.failed_files += 1;
                    complete = false;
                }
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
fn write_gray(path: &Path, value: u8) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    image::GrayImage::from_pixel(4, 4, image::Luma([value]))
        .save_with_format(path, image::ImageFormat::Png)
        .unwrap();
}

#[cfg(test)]
fn test_dataset(layout: OutputLayout) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path();
    for view in &["top", "front_left", "back_right"] {
        // variation 1 shows the object, variation 2 is an empty box
        let values = if *view == "top" { [200, 250] } else { [100, 100] };
        for (i, v) in values.iter().enumerate() {
            write_gray(&view_dir(out, layout, view, "mugs").join(format!("blue_v{}.png", i + 1)), *v);
        }
    }
    dir
}

#[test]
fn test_thresholds_from_references() {
    let t = Thresholds::from_means(250.0, Some(180.0), 5.0);
    assert_eq!(t.upper, 245.0);
    assert_eq!(t.lower, Some(185.0));
    assert_eq!(t.verdict(246.0), Verdict::TooBright);
    assert_eq!(t.verdict(200.0), Verdict::Accepted);
    assert_eq!(t.verdict(184.0), Verdict::TooDark);
    assert_eq!(Thresholds::fixed(245.0).verdict(0.0), Verdict::Accepted);
}

#[test]
fn test_calibrate_from_images() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty.png");
    let object = dir.path().join("object.png");
    write_gray(&empty, 250);
    write_gray(&object, 180);
    let t = Thresholds::calibrate(&empty, Some(&object), 5.0).unwrap();
    assert_eq!(t, Thresholds::from_means(250.0, Some(180.0), 5.0));

    match Thresholds::calibrate(&dir.path().join("missing.png"), None, 5.0) {
        Err(FilterError::Reference { .. }) => (),
        other => panic!("expected a reference error, got {:?}", other),
    }
}

#[test]
fn test_filter_removes_all_views() {
    let data = test_dataset(OutputLayout::ViewMajor);
    let out = data.path();
    let report = filter_dataset(out, &Thresholds::fixed(245.0), &FilterOptions::default()).unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.too_bright, 1);
    assert_eq!(report.deleted_files, 3);
    for view in &["top", "front_left", "back_right"] {
        assert!(out.join(view).join("mugs").join("blue_v1.png").exists());
        assert!(!out.join(view).join("mugs").join("blue_v2.png").exists());
    }
}

#[test]
fn test_filter_category_major() {
    let data = test_dataset(OutputLayout::CategoryMajor);
    let out = data.path();
    let options = FilterOptions {
        layout: OutputLayout::CategoryMajor,
        ..Default::default()
    };
    let report = filter_dataset(out, &Thresholds::fixed(245.0), &options).unwrap();
    assert_eq!(report.deleted_files, 3);
    assert!(!out.join("mugs").join("front_left").join("blue_v2.png").exists());
    assert!(out.join("mugs").join("front_left").join("blue_v1.png").exists());
}

#[test]
fn test_dry_run_keeps_files() {
    let data = test_dataset(OutputLayout::ViewMajor);
    let out = data.path();
    let options = FilterOptions {
        dry_run: true,
        ..Default::default()
    };
    let report = filter_dataset(out, &Thresholds::fixed(245.0), &options).unwrap();
    assert_eq!(report.too_bright, 1);
    assert_eq!(report.deleted_files, 3);
    assert!(out.join("top").join("mugs").join("blue_v2.png").exists());
    assert!(out.join("back_right").join("mugs").join("blue_v2.png").exists());
}

#[test]
fn test_filter_idempotent() {
    let data = test_dataset(OutputLayout::ViewMajor);
    let out = data.path();
    let thresholds = Thresholds::from_means(250.0, Some(180.0), 5.0);
    let first = filter_dataset(out, &thresholds, &FilterOptions::default()).unwrap();
    assert_eq!(first.deleted_files, 3);
    let second = filter_dataset(out, &thresholds, &FilterOptions::default()).unwrap();
    assert_eq!(second.examined, 1);
    assert_eq!(second.accepted, 1);
    assert_eq!(second.deleted_files, 0);
}

#[test]
fn test_missing_sibling_ignored() {
    let data = test_dataset(OutputLayout::ViewMajor);
    let out = data.path();
    fs::remove_file(out.join("front_left").join("mugs").join("blue_v2.png")).unwrap();
    let report = filter_dataset(out, &Thresholds::fixed(245.0), &FilterOptions::default()).unwrap();
    assert_eq!(report.deleted_files, 2);
}

#[test]
fn test_reference_kept_when_sibling_fails() {
    let data = test_dataset(OutputLayout::ViewMajor);
    let out = data.path();
    // a directory in place of the image cannot be removed as a file
    let blocked = out.join("front_left").join("mugs").join("blue_v2.png");
    fs::remove_file(&blocked).unwrap();
    fs::create_dir(&blocked).unwrap();

    let report = filter_dataset(out, &Thresholds::fixed(245.0), &FilterOptions::default()).unwrap();
    assert_eq!(report.too_bright, 1);
    assert_eq!(report.failed_files, 1);
    assert!(!out.join("back_right").join("mugs").join("blue_v2.png").exists());
    assert!(out.join("top").join("mugs").join("blue_v2.png").exists());

    // once the view can be removed a second pass completes the set
    fs::remove_dir(&blocked).unwrap();
    write_gray(&blocked, 100);
    let report = filter_dataset(out, &Thresholds::fixed(245.0), &FilterOptions::default()).unwrap();
    assert_eq!(report.failed_files, 0);
    assert_eq!(report.deleted_files, 2);
    assert!(!blocked.exists());
    assert!(!out.join("top").join("mugs").join("blue_v2.png").exists());
}

#[test]
fn test_analyze_distribution() {
    let records = [10.0, 40.0, 20.0, 30.0]
        .iter()
        .enumerate()
        .map(|(i, b)| BrightnessRecord {
            image: ReferenceImage {
                category: "c".to_string(),
                path: PathBuf::from(format!("{}.png", i)),
            },
            brightness: *b,
        })
        .collect::<Vec<_>>();
    let d = analyze(&records, 3).unwrap();
    assert_eq!(d.count, 4);
    assert_eq!(d.min, 10.0);
    assert_eq!(d.max, 40.0);
    assert_eq!(d.mean, 25.0);
    assert_eq!(d.median, 25.0);
    assert_eq!(d.samples.len(), 3);
    assert_eq!(d.samples[0].1.brightness, 10.0);
    assert_eq!(d.samples[2].1.brightness, 40.0);
    assert!(analyze(&[], 3).is_none());
}
