//! Image loading for the VOC directory layout.

use std::path::PathBuf;

use image::DynamicImage;
use voc_core::{Error, Result};

/// Loads images from a VOC data directory by image id.
pub struct ImageLoader {
    image_dir: PathBuf,
}

impl ImageLoader {
    /// Creates a loader rooted at a VOC data directory.
    pub fn new(voc_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: voc_dir.into().join("JPEGImages"),
        }
    }

    /// Loads the image for an id.
    pub fn load(&self, id: &str) -> Result<DynamicImage> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "image file not found: {}",
                path.display()
            )));
        }

        image::open(&path)
            .map_err(|e| Error::Image(format!("failed to load {}: {e}", path.display())))
    }

    /// Full path for an image id.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.image_dir.join(format!("{id}.jpg"))
    }

    /// Whether an image exists for an id.
    pub fn exists(&self, id: &str) -> bool {
        self.path_for(id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn test_load_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("JPEGImages");
        std::fs::create_dir_all(&image_dir).unwrap();
        RgbImage::new(8, 6)
            .save(image_dir.join("000001.jpg"))
            .unwrap();

        let loader = ImageLoader::new(dir.path());
        assert!(loader.exists("000001"));
        let img = loader.load("000001").unwrap();
        assert_eq!(img.width(), 8);
        assert_eq!(img.height(), 6);
    }

    #[test]
    fn test_missing_image_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ImageLoader::new(dir.path());
        assert!(!loader.exists("nope"));
        assert!(matches!(loader.load("nope"), Err(Error::NotFound(_))));
    }
}
