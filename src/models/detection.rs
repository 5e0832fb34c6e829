use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// UI element categories the detector is asked to find.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Tag {
    Button,
    Input,
    Radio,
    Dropdown,
}

/// A detected UI element. `(x, y)` is the top-left corner in pixels.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct Annotation {
    #[garde(range(min = 0.0))]
    pub x: f64,

    #[garde(range(min = 0.0))]
    pub y: f64,

    #[garde(custom(positive))]
    pub width: f64,

    #[garde(custom(positive))]
    pub height: f64,

    #[garde(skip)]
    pub tag: Tag,
}

fn positive(value: &f64, _ctx: &()) -> garde::Result {
    if *value > 0.0 {
        Ok(())
    } else {
        Err(garde::Error::new("must be greater than zero"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

/// Output of a single detector call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<ImageDimensions>,
}

/// Result stored on a COMPLETED job and pushed to live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultPayload {
    pub annotations: Vec<Annotation>,
    pub image_dimensions: Option<ImageDimensions>,
    pub total_elements: usize,
    pub model_used: String,
    pub processing_time_secs: f64,
    pub completed_at: DateTime<Utc>,
}

impl ResultPayload {
    pub fn new(
        annotations: Vec<Annotation>,
        image_dimensions: Option<ImageDimensions>,
        model_used: &str,
        processing_time_secs: f64,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            total_elements: annotations.len(),
            annotations,
            image_dimensions,
            model_used: model_used.to_string(),
            processing_time_secs,
            completed_at,
        }
    }
}
