pub mod cancel;
pub mod queue;

pub use cancel::CancellationGate;
pub use queue::{IngestJob, IngestionDeps, IngestionQueue};
