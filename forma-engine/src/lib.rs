pub mod context;
pub mod prompt;
pub mod subsystems;

pub use context::ContextPayload;
pub use subsystems::bulk::{
    bulk_generate_and_persist_debriefs, BulkFailure, BulkGenerateOptions, BulkOutcome,
};
pub use subsystems::generate::{
    create_backend_from_config, generate_and_persist_debrief, spawn_generate_task, DebriefOutcome,
    GenerateOptions,
};
