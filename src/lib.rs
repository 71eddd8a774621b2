pub mod llm;
pub mod pipeline;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod store;
pub mod text;
pub mod tokens;
pub mod utils;

pub use llm::{GeminiClient, GenerateRequest, GenerateResponse, LlmClient};
pub use scheduler::{EventSender, RowEvent, RunControl};
pub use service::{RunReport, TranslationRun, TranslationService};
pub use session::SessionTermMemory;
pub use store::{
    GlossaryEntry, MemoryStore, ProjectStore, RedbStore, RowRecord, RowStatus, RowUpdate, TmKey,
};
pub use utils::{AppConfig, ModelConfig, Result, RunOptions, TranslateError};
