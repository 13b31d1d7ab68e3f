//! Typed requests against the hosted chart-reading model.
//!
//! Every failure on this path becomes chat text: the transcript is the error
//! channel, so `analyze` never returns an error.

use graphchat_contracts::session::{payload_mime_type, UploadedImage};

use crate::{error_chain_text, truncate_text};
use crate::provider::{VisionPart, VisionProvider, VisionRequest};

pub const MIN_POINT_COUNT: u64 = 2;
pub const DEFAULT_POINT_COUNT: u64 = 10;

pub const PERSONA_PREAMBLE: &str = "You are an expert in reading charts and graphs. Look at the given graph and answer the following question accurately. Provide the numeric value or observation directly based on the graph content.";

pub const MODEL_UNAVAILABLE: &str =
    "Gemini model not available. Please check your API key and configuration.";
pub const IMAGE_UNAVAILABLE: &str = "Image data not available for analysis.";
pub const EMPTY_RESPONSE: &str = "Gemini did not return any content for this query. ";

const BAR_CHART_INSTRUCTION: &str = "This is a bar chart. For each bar, identify its label on the category axis (X-axis) and read its corresponding numerical value from the value axis (Y-axis). Return the results as a clean list of 'Bar Label: Value' pairs. If it is a grouped or stacked bar chart, identify the series for each bar (by color or legend).";

fn line_chart_instruction(point_count: u64) -> String {
    format!(
        "This is a line chart. Read the (x, y) coordinates for {point_count} points from it. The points should be evenly distributed along the X-axis, from minimum to maximum. If there is more than one line, extract points for all lines. Return the results in the format: '[line name or color]: list of (x, y) pairs'."
    )
}

fn scatter_instruction(point_count: u64) -> String {
    format!(
        "This is a scatter plot. Extract the (x, y) coordinates for {point_count} points for it. The points should be evenly distributed along the X-axis, from minimum to maximum. If there are multiple groups of points (differentiated by color or shape), identify which group each point belongs to. Return the results as a list of (x, y) coordinates, grouped by series name if applicable."
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisRequest {
    FreeFormQuestion(String),
    LineChartExtraction { point_count: u64 },
    BarChartExtraction,
    ScatterExtraction { point_count: u64 },
}

impl AnalysisRequest {
    pub fn line_chart(point_count: u64) -> Result<Self, String> {
        validate_point_count(point_count)?;
        Ok(Self::LineChartExtraction { point_count })
    }

    pub fn scatter(point_count: u64) -> Result<Self, String> {
        validate_point_count(point_count)?;
        Ok(Self::ScatterExtraction { point_count })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FreeFormQuestion(_) => "question",
            Self::LineChartExtraction { .. } => "line_chart",
            Self::BarChartExtraction => "bar_chart",
            Self::ScatterExtraction { .. } => "scatter_plot",
        }
    }

    /// Instruction sent after the persona preamble.
    pub fn instruction(&self) -> String {
        match self {
            Self::FreeFormQuestion(text) => text.clone(),
            Self::LineChartExtraction { point_count } => line_chart_instruction(*point_count),
            Self::BarChartExtraction => BAR_CHART_INSTRUCTION.to_string(),
            Self::ScatterExtraction { point_count } => scatter_instruction(*point_count),
        }
    }

    /// The user-side line recorded in the chat transcript.
    pub fn transcript_text(&self) -> String {
        match self {
            Self::FreeFormQuestion(text) => text.clone(),
            Self::LineChartExtraction { point_count } => {
                format!("Request for detection of {point_count} points on a line chart.")
            }
            Self::BarChartExtraction => "Request for bar chart value extraction.".to_string(),
            Self::ScatterExtraction { point_count } => {
                format!("Request for detection of {point_count} points on a scatter plot.")
            }
        }
    }
}

fn validate_point_count(point_count: u64) -> Result<(), String> {
    if point_count < MIN_POINT_COUNT {
        return Err(format!(
            "point count must be at least {MIN_POINT_COUNT} (got {point_count})"
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Answered,
    ModelUnavailable,
    ImageUnavailable,
    Blocked,
    Empty,
    Failed,
}

impl ReplyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyKind::Answered => "answered",
            ReplyKind::ModelUnavailable => "model_unavailable",
            ReplyKind::ImageUnavailable => "image_unavailable",
            ReplyKind::Blocked => "blocked",
            ReplyKind::Empty => "empty",
            ReplyKind::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisReply {
    pub kind: ReplyKind,
    pub text: String,
}

impl AnalysisReply {
    fn new(kind: ReplyKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

pub struct AnalysisGateway {
    provider: Box<dyn VisionProvider>,
    model: String,
}

impl AnalysisGateway {
    pub fn new(provider: Box<dyn VisionProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn analyze(
        &self,
        credential: Option<&str>,
        image: &UploadedImage,
        request: &AnalysisRequest,
    ) -> String {
        self.analyze_detailed(credential, image, request).text
    }

    /// Same as [`analyze`](Self::analyze) but also says which path produced
    /// the text. Each call is a fresh remote call.
    pub fn analyze_detailed(
        &self,
        credential: Option<&str>,
        image: &UploadedImage,
        request: &AnalysisRequest,
    ) -> AnalysisReply {
        let Some(api_key) = credential.map(str::trim).filter(|key| !key.is_empty()) else {
            return AnalysisReply::new(ReplyKind::ModelUnavailable, MODEL_UNAVAILABLE);
        };
        if !is_transportable_key(api_key) {
            return AnalysisReply::new(ReplyKind::ModelUnavailable, MODEL_UNAVAILABLE);
        }
        if !image.has_payload() {
            return AnalysisReply::new(ReplyKind::ImageUnavailable, IMAGE_UNAVAILABLE);
        }

        let mime_type = payload_mime_type(&image.bytes).unwrap_or("image/png");
        let vision_request = VisionRequest {
            model: self.model.clone(),
            api_key: api_key.to_string(),
            parts: vec![
                VisionPart::Text(PERSONA_PREAMBLE.to_string()),
                VisionPart::Text(request.instruction()),
                VisionPart::InlineImage {
                    mime_type: mime_type.to_string(),
                    data: image.bytes.clone(),
                },
            ],
        };

        match self.provider.generate(&vision_request) {
            Ok(response) => match (response.text, response.block_reason) {
                (Some(text), _) => AnalysisReply::new(ReplyKind::Answered, text),
                (None, Some(reason)) => AnalysisReply::new(
                    ReplyKind::Blocked,
                    format!("Response blocked by Gemini due to: {reason}. "),
                ),
                (None, None) => AnalysisReply::new(ReplyKind::Empty, EMPTY_RESPONSE),
            },
            Err(err) => {
                // Redact before truncating so no fragment of the key survives.
                let detail = error_chain_text(&err, usize::MAX).replace(api_key, "***");
                AnalysisReply::new(
                    ReplyKind::Failed,
                    format!(
                        "An error occurred while trying to get a response from Gemini: {}. ",
                        truncate_text(&detail, 600)
                    ),
                )
            }
        }
    }
}

/// A key the provider cannot even receive (whitespace, control characters,
/// non-ASCII) is a configuration failure rather than a remote one.
fn is_transportable_key(key: &str) -> bool {
    key.chars().all(|ch| ch.is_ascii_graphic())
}
