use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version stamped into exported answer files; imports above this are rejected.
pub const OFFLINE_ANSWER_SCHEMA_VERSION: u32 = 1;

lazy_static! {
    static ref REF_ID_RE: Regex = Regex::new(r"^(\d+)-([A-Za-z][A-Za-z0-9]*)$").unwrap();
    static ref CAMEL_BOUNDARY_RE: Regex = Regex::new(r"([a-z0-9])([A-Z])").unwrap();
}

/// Maps an embeddable reference id (`"123-ManagedInteractive"`) to the id answers
/// are stored under (`"managed_interactive_123"`). Ids that are already in the
/// stored form are returned unchanged.
pub fn question_id_from_ref_id(ref_id: &str) -> String {
    match REF_ID_RE.captures(ref_id) {
        Some(caps) => {
            let kind = CAMEL_BOUNDARY_RE
                .replace_all(&caps[2], "${1}_${2}")
                .to_lowercase();
            format!("{}_{}", kind, &caps[1])
        }
        None => ref_id.to_string(),
    }
}

/// One learner's response to one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub id: String,
    pub question_id: String,
    /// Required by the local store; the remote store partitions by document path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(flatten)]
    pub kind: AnswerKind,
    pub report_state: String,
}

impl AnswerRecord {
    pub fn new(question_ref_id: &str, kind: AnswerKind, report_state: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            question_id: question_id_from_ref_id(question_ref_id),
            activity: None,
            kind,
            report_state,
        }
    }

    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnswerKind {
    #[serde(rename = "interactive_state")]
    InteractiveState {},
    #[serde(rename = "open_response_answer")]
    OpenResponse { answer: String },
    #[serde(rename = "multiple_choice_answer")]
    MultipleChoice { answer: MultipleChoiceAnswer },
    #[serde(rename = "image_question_answer")]
    ImageQuestion { answer: ImageQuestionAnswer },
}

impl AnswerKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            AnswerKind::InteractiveState {} => "interactive_state",
            AnswerKind::OpenResponse { .. } => "open_response_answer",
            AnswerKind::MultipleChoice { .. } => "multiple_choice_answer",
            AnswerKind::ImageQuestion { .. } => "image_question_answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipleChoiceAnswer {
    pub choice_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageQuestionAnswer {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveIdentity {
    pub id: String,
    pub name: String,
}

/// Envelope a report view needs to re-render an interactive in report mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportState {
    pub mode: String,
    pub authored_state: String,
    pub interactive_state: String,
    pub interactive: InteractiveIdentity,
    pub version: u32,
}

impl ReportState {
    pub fn new(
        authored_state: &serde_json::Value,
        interactive_state: &serde_json::Value,
        interactive: InteractiveIdentity,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            mode: "report".to_string(),
            authored_state: serde_json::to_string(authored_state)?,
            interactive_state: serde_json::to_string(interactive_state)?,
            interactive,
            version: 1,
        })
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Teacher feedback attached to a question, read from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionFeedback {
    pub question_id: String,
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
}
