pub mod citations;
pub mod excerpt;
pub mod generator;
pub mod models;
pub mod orchestrator;

pub use generator::Generator;
pub use models::{AnswerRequest, AnswerResult};
pub use orchestrator::Orchestrator;
