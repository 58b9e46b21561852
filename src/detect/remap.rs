//! Detector label -> reference taxonomy mapping.
//!
//! The detector speaks VOC-style names ("tvmonitor", "sofa", ...) while reference
//! annotations use COCO names. Only the entries below differ; every other label is
//! passed through unchanged before the taxonomy lookup.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::detect::result::DetectionBox;

/// Fixed detector-to-reference name table.
pub const CATEGORY_REMAP: &[(&str, &str)] = &[
    ("tvmonitor", "tv"),
    ("diningtable", "dining table"),
    ("pottedplant", "potted plant"),
    ("sofa", "couch"),
    ("aeroplane", "airplane"),
    ("motorbike", "motorcycle"),
];

/// Canonical reference name for a detector label.
pub fn canonical_label(label: &str) -> &str {
    CATEGORY_REMAP
        .iter()
        .find(|(from, _)| *from == label)
        .map(|(_, to)| *to)
        .unwrap_or(label)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: u32,
    pub name: String,
}

/// Reference taxonomy (category id <-> name).
#[derive(Clone, Debug, Default)]
pub struct Taxonomy {
    categories: Vec<Category>,
}

#[derive(Deserialize)]
struct AnnotationFile {
    categories: Vec<Category>,
}

impl Taxonomy {
    pub fn new(categories: Vec<Category>) -> Self {
        Self { categories }
    }

    /// Parse the `categories` array of a COCO-style annotation document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: AnnotationFile = serde_json::from_str(raw)?;
        Ok(Self::new(file.categories))
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Reference id for a detector label, after remapping. `None` when the taxonomy has
    /// no such category.
    pub fn category_id(&self, label: &str) -> Option<u32> {
        let name = canonical_label(label);
        self.categories
            .iter()
            .find(|category| category.name == name)
            .map(|category| category.id)
    }

    pub fn category_name(&self, id: u32) -> Option<&str> {
        self.categories
            .iter()
            .find(|category| category.id == id)
            .map(|category| category.name.as_str())
    }
}

#[derive(Deserialize)]
struct ImageEntry {
    id: u64,
    file_name: String,
}

#[derive(Deserialize)]
struct ImageListFile {
    #[serde(default)]
    images: Vec<ImageEntry>,
}

/// File name -> image id, from the `images` array of an annotation file.
#[derive(Clone, Debug, Default)]
pub struct ImageIndex {
    by_name: HashMap<String, u64>,
}

impl ImageIndex {
    fn new(images: Vec<ImageEntry>) -> Self {
        Self {
            by_name: images
                .into_iter()
                .map(|image| (image.file_name, image.id))
                .collect(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ImageListFile = serde_json::from_str(raw)?;
        Ok(Self::new(file.images))
    }

    pub fn image_id(&self, file_name: &str) -> Option<u64> {
        self.by_name.get(file_name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[derive(Deserialize)]
struct ReferenceFile {
    categories: Vec<Category>,
    #[serde(default)]
    images: Vec<ImageEntry>,
}

/// Taxonomy and image index from one pass over an annotation document.
pub fn parse_annotations(raw: &str) -> Result<(Taxonomy, ImageIndex)> {
    let file: ReferenceFile = serde_json::from_str(raw)?;
    Ok((Taxonomy::new(file.categories), ImageIndex::new(file.images)))
}

/// Read and parse an annotation file once.
pub fn load_annotations(path: &Path) -> Result<(Taxonomy, ImageIndex)> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read annotations {}: {}", path.display(), e))?;
    parse_annotations(&raw).map_err(|e| anyhow!("invalid annotations {}: {}", path.display(), e))
}

/// Detection expressed against the reference taxonomy (`bbox` is `[x, y, w, h]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDetection {
    pub image_id: u64,
    pub category_id: u32,
    pub bbox: [i32; 4],
    pub score: f32,
}

/// Convert boxes into reference detections. A box whose label has no category is
/// logged and skipped; the rest are still converted.
pub fn to_reference_detections(
    image_id: u64,
    boxes: &[DetectionBox],
    taxonomy: &Taxonomy,
) -> Vec<ReferenceDetection> {
    boxes
        .iter()
        .filter_map(|b| match taxonomy.category_id(&b.label) {
            Some(category_id) => Some(ReferenceDetection {
                image_id,
                category_id,
                bbox: [b.left, b.top, b.width(), b.height()],
                score: b.confidence,
            }),
            None => {
                log::warn!("category {} not found", b.label);
                None
            }
        })
        .collect()
}
