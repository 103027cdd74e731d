pub mod chunker;
pub mod parser;

pub use chunker::Chunker;
pub use parser::{DocumentParser, ParsedDocument};
