pub mod answer;
pub mod export;
pub mod log;
pub mod offline;
pub mod portal;
pub mod sync;

pub use answer::{
    question_id_from_ref_id, AnswerKind, AnswerRecord, ImageQuestionAnswer, InteractiveIdentity,
    MultipleChoiceAnswer, QuestionFeedback, ReportState, OFFLINE_ANSWER_SCHEMA_VERSION,
};
pub use export::{ExportFile, ImportFile};
pub use log::LogEntry;
pub use offline::OfflineActivity;
pub use portal::{AnonymousPortalData, AuthenticatedPortalData, PortalData, PortalJwt};
pub use sync::{PluginSyncStatus, PluginSyncUpdate, SyncReport};
