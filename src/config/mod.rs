pub mod settings;

pub use settings::{
    DatabaseConfig, EmbeddingConfig, GeneratorProvider, LimitsConfig, LlmConfig, PromptsConfig,
    RagConfig, RetrievalModeConfig, ServerConfig, Settings, StorageConfig,
};
