use image::GrayImage;

use super::segmentation::count_set;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeverityEstimate {
    pub lesion_area: u64,
    pub leaf_area: u64,
    /// `100 * lesion_area / leaf_area`, 0 for an empty leaf.
    pub lesion_ratio: f64,
}

pub struct SeverityCalculator;

impl SeverityCalculator {
    pub fn from_counts(lesion_area: u64, leaf_area: u64) -> SeverityEstimate {
        let lesion_ratio = if leaf_area == 0 {
            0.0
        } else {
            (100.0 * lesion_area as f64 / leaf_area as f64).clamp(0.0, 100.0)
        };
        SeverityEstimate {
            lesion_area,
            leaf_area,
            lesion_ratio,
        }
    }

    pub fn compute(lesion_mask: &GrayImage, leaf_mask: &GrayImage) -> SeverityEstimate {
        Self::from_counts(count_set(lesion_mask), count_set(leaf_mask))
    }
}
