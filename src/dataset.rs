use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{PotholeError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitReport {
    pub total: usize,
    pub requested: usize,
    pub moved: Vec<String>,
    /// Sampled images left in train because their label was missing.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub train_images: PathBuf,
    pub train_labels: PathBuf,
    pub val_images: PathBuf,
    pub val_labels: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: &Path) -> Self {
        DatasetLayout {
            train_images: root.join("images").join("train"),
            train_labels: root.join("labels").join("train"),
            val_images: root.join("images").join("val"),
            val_labels: root.join("labels").join("val"),
        }
    }
}

fn label_name(image: &Path) -> String {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}.txt", stem)
}

/// `rename`, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Move a random `ratio` share of the training images, with their labels,
/// into the validation folders. Expects the YOLO layout `images/{train,val}`
/// and `labels/{train,val}` with one `<stem>.txt` label per image.
pub fn split_dataset<R: Rng + ?Sized>(root: &Path, ratio: f64, rng: &mut R) -> Result<SplitReport> {
    if !(0.0..=1.0).contains(&ratio) {
        return Err(PotholeError::InvalidRatio(ratio));
    }

    let layout = DatasetLayout::new(root);
    if !layout.train_images.is_dir() {
        return Err(PotholeError::MissingDirectory(layout.train_images));
    }
    fs::create_dir_all(&layout.val_images)?;
    fs::create_dir_all(&layout.val_labels)?;

    let mut train_images = Vec::new();
    for entry in fs::read_dir(&layout.train_images)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            train_images.push(entry.path());
        }
    }
    // read_dir order is platform dependent
    train_images.sort();

    let total = train_images.len();
    let requested = (total as f64 * ratio).floor() as usize;

    info!("Total images: {}", total);
    info!("Moving {} images to validation set", requested);

    let mut report = SplitReport {
        total,
        requested,
        ..SplitReport::default()
    };

    let sampled: Vec<PathBuf> = train_images
        .choose_multiple(rng, requested)
        .cloned()
        .collect();

    for img_path in sampled {
        let img_name = img_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let label = label_name(&img_path);
        let label_path = layout.train_labels.join(&label);

        if !label_path.exists() {
            warn!("No label file found for {}", img_name);
            report.skipped.push(img_name);
            continue;
        }

        move_file(&img_path, &layout.val_images.join(&img_name))?;
        move_file(&label_path, &layout.val_labels.join(&label))?;
        info!("Moved {} and its label to validation set", img_name);
        report.moved.push(img_name);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs::File;

    fn dataset(n: usize, unlabeled: &[usize]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        fs::create_dir_all(&layout.train_images).unwrap();
        fs::create_dir_all(&layout.train_labels).unwrap();
        for i in 0..n {
            File::create(layout.train_images.join(format!("img_{i:03}.jpg"))).unwrap();
            if !unlabeled.contains(&i) {
                fs::write(layout.train_labels.join(format!("img_{i:03}.txt")), "0 0.5 0.5 0.1 0.1\n")
                    .unwrap();
            }
        }
        dir
    }

    fn count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_split_moves_floor_of_ratio() {
        let dir = dataset(11, &[]);
        let mut rng = StdRng::seed_from_u64(7);
        let report = split_dataset(dir.path(), 0.2, &mut rng).unwrap();

        assert_eq!(report.total, 11);
        assert_eq!(report.requested, 2);
        assert_eq!(report.moved.len(), 2);
        assert!(report.skipped.is_empty());

        let layout = DatasetLayout::new(dir.path());
        assert_eq!(count(&layout.train_images), 9);
        assert_eq!(count(&layout.train_labels), 9);
        assert_eq!(count(&layout.val_images), 2);
        for name in &report.moved {
            assert!(layout.val_images.join(name).exists());
            assert!(layout.val_labels.join(label_name(Path::new(name))).exists());
        }
    }

    #[test]
    fn test_unlabeled_images_stay_in_train() {
        let dir = dataset(4, &[0, 1, 2, 3]);
        let mut rng = StdRng::seed_from_u64(1);
        let report = split_dataset(dir.path(), 0.5, &mut rng).unwrap();

        assert_eq!(report.requested, 2);
        assert!(report.moved.is_empty());
        assert_eq!(report.skipped.len(), 2);
        let layout = DatasetLayout::new(dir.path());
        assert_eq!(count(&layout.train_images), 4);
        assert_eq!(count(&layout.val_images), 0);
    }

    #[test]
    fn test_same_seed_same_split() {
        let a = dataset(20, &[]);
        let b = dataset(20, &[]);
        let ra = split_dataset(a.path(), 0.3, &mut StdRng::seed_from_u64(42)).unwrap();
        let rb = split_dataset(b.path(), 0.3, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(ra.moved, rb.moved);
    }

    #[test]
    fn test_empty_train_dir() {
        let dir = dataset(0, &[]);
        let report = split_dataset(dir.path(), 0.2, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(report, SplitReport::default());
        assert!(DatasetLayout::new(dir.path()).val_labels.is_dir());
    }

    #[test]
    fn test_rejects_bad_ratio_and_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            split_dataset(dir.path(), -0.1, &mut rng),
            Err(PotholeError::InvalidRatio(_))
        ));
        assert!(matches!(
            split_dataset(dir.path(), 0.2, &mut rng),
            Err(PotholeError::MissingDirectory(_))
        ));
    }
}
