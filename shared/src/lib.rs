use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumCount, EnumIter, EnumString};

/// Result label used whenever no disease could be assigned.
pub const UNKNOWN_CLASS: &str = "Unknown";

/// Disease classes in the order of the model's output vector.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    EnumCount,
    AsRefStr,
)]
pub enum DiseaseClass {
    #[serde(rename = "Neck_Blast")]
    #[strum(serialize = "Neck_Blast")]
    NeckBlast,
    #[serde(rename = "Rice Hispa")]
    #[strum(serialize = "Rice Hispa")]
    RiceHispa,
    #[serde(rename = "Sheath Blight")]
    #[strum(serialize = "Sheath Blight")]
    SheathBlight,
    #[serde(rename = "bacterial_leaf_blight")]
    #[strum(serialize = "bacterial_leaf_blight")]
    BacterialLeafBlight,
    #[serde(rename = "bacterial_leaf_streak")]
    #[strum(serialize = "bacterial_leaf_streak")]
    BacterialLeafStreak,
    #[serde(rename = "bacterial_panicle_blight")]
    #[strum(serialize = "bacterial_panicle_blight")]
    BacterialPanicleBlight,
    #[serde(rename = "brown_spot")]
    #[strum(serialize = "brown_spot")]
    BrownSpot,
    #[serde(rename = "dead_heart")]
    #[strum(serialize = "dead_heart")]
    DeadHeart,
    #[serde(rename = "downy_mildew")]
    #[strum(serialize = "downy_mildew")]
    DownyMildew,
    #[serde(rename = "leaf_scald")]
    #[strum(serialize = "leaf_scald")]
    LeafScald,
    #[serde(rename = "narrow_brown_spot")]
    #[strum(serialize = "narrow_brown_spot")]
    NarrowBrownSpot,
    #[serde(rename = "normal")]
    #[strum(serialize = "normal")]
    Normal,
}

impl DiseaseClass {
    /// Class at position `index` of the model output.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::iter().nth(index)
    }

    pub fn index(self) -> usize {
        Self::iter().position(|c| c == self).unwrap_or_default()
    }
}

/// Event published when an application with leaf photographs is submitted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SubmissionEvent {
    #[serde(rename = "submissionId")]
    pub submission_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "objectKeysForAIAnalysis", default)]
    pub object_keys: Vec<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Top3PredictionDto {
    pub class_name: String,
    pub confidence: f64,
    pub rank: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnalysisImageDto {
    pub image_type: String,
    pub image_path: String,
    pub presigned_url: Option<String>,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AiResultDto {
    pub id: String,
    pub result: String,
    #[serde(rename = "applicationId")]
    pub application_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub prediction: String,
    pub accuracy: String,
    pub confidence: f64,
    pub severity: f64,
    pub lesion_area: f64,
    pub leaf_area: f64,
    pub image_path: Option<String>,
    pub original_image_url: Option<String>,
    pub top3_predictions: Vec<Top3PredictionDto>,
    pub leaf_analysis_images: Vec<AnalysisImageDto>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PredictionStatistics {
    pub total_predictions: u64,
    pub disease_distribution: BTreeMap<String, u64>,
    pub average_confidence: f64,
    pub unknown_predictions: u64,
    pub success_rate: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageUrlDto {
    pub image_url: String,
    pub expires_in: u64,
    pub image_path: String,
    pub result_info: AiResultDto,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnalysisImagesDto {
    pub result_id: String,
    pub total_images: usize,
    pub analysis_images: Vec<AnalysisImageDto>,
}

/// Envelope shared by every successful API response.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            message: message.into(),
        }
    }
}
