//! LLM provider abstraction, model routing, and the repository analyzer.

pub mod analyzer;
pub mod llm;
pub mod model_router;

pub use analyzer::RepoAnalyzer;
pub use llm::{LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse, MockProvider};
pub use model_router::{ModelCatalog, ModelSpec};
