//! VOC annotation index parsing.
//!
//! The VOC layout keeps one file per (class, split) pair under
//! `ImageSets/Main/<class>_<split>.txt`, each line holding an image id and
//! a presence flag: 1 = present, -1 = absent, 0 = difficult. Difficult
//! entries map to the ignore label and take no part in loss or metrics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use voc_core::{Error, Result, Split, IGNORE_LABEL, NUM_CLASSES, VOC_CLASSES};

/// Maps a VOC presence flag to a ground-truth label.
fn flag_to_label(flag: i32) -> Result<u8> {
    match flag {
        1 => Ok(1),
        -1 => Ok(0),
        0 => Ok(IGNORE_LABEL),
        other => Err(Error::Dataset(format!("invalid presence flag {other}"))),
    }
}

/// Image ids and per-class label vectors for one split, in a stable order.
#[derive(Debug, Clone)]
pub struct VocIndex {
    ids: Vec<String>,
    labels: Vec<Vec<u8>>,
}

impl VocIndex {
    /// Loads the index for a split from a VOC data directory.
    ///
    /// The first class file fixes the image order; every class file must
    /// cover the same ids.
    pub fn load(voc_dir: &Path, split: Split) -> Result<Self> {
        let mut ids: Vec<String> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut labels: Vec<Vec<u8>> = Vec::new();

        for (class_idx, class) in VOC_CLASSES.iter().enumerate() {
            let path = Self::class_file(voc_dir, class, split);
            let content = std::fs::read_to_string(&path).map_err(|e| {
                Error::Dataset(format!("failed to read {}: {e}", path.display()))
            })?;

            for (line_no, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let mut parts = line.split_whitespace();
                let (id, flag) = match (parts.next(), parts.next()) {
                    (Some(id), Some(flag)) => (id, flag),
                    _ => {
                        return Err(Error::Dataset(format!(
                            "malformed line {} in {}",
                            line_no + 1,
                            path.display()
                        )))
                    }
                };
                let flag: i32 = flag.parse().map_err(|e| {
                    Error::Dataset(format!(
                        "invalid flag {flag:?} in {}: {e}",
                        path.display()
                    ))
                })?;
                let label = flag_to_label(flag)?;

                let pos = match positions.get(id) {
                    Some(&pos) => pos,
                    None if class_idx == 0 => {
                        let pos = ids.len();
                        positions.insert(id.to_string(), pos);
                        ids.push(id.to_string());
                        labels.push(vec![IGNORE_LABEL; NUM_CLASSES]);
                        pos
                    }
                    None => {
                        return Err(Error::Dataset(format!(
                            "image {id} appears in {} but not in the {} index",
                            path.display(),
                            VOC_CLASSES[0]
                        )))
                    }
                };
                labels[pos][class_idx] = label;
            }
        }

        if ids.is_empty() {
            return Err(Error::Dataset(format!(
                "no images listed for split {split} under {}",
                voc_dir.display()
            )));
        }

        Ok(Self { ids, labels })
    }

    fn class_file(voc_dir: &Path, class: &str, split: Split) -> PathBuf {
        voc_dir
            .join("ImageSets")
            .join("Main")
            .join(format!("{class}_{split}.txt"))
    }

    /// Number of images in the split.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the split is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Image id at a position.
    pub fn id(&self, index: usize) -> &str {
        &self.ids[index]
    }

    /// Per-class label vector at a position.
    pub fn labels(&self, index: usize) -> &[u8] {
        &self.labels[index]
    }
}
