pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod models;

pub use config::FormaConfig;
pub use error::DebriefError;
pub use generation::{
    classify_failure, FailureClass, GeminiGenerationClient, GenerationBackend, GenerationConfig,
    GenerationError, GenerationRequest, GenerationResponse,
};
