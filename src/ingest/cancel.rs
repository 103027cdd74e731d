//! One atomic boolean per in-flight document ingestion. The flag is handed
//! to each pipeline step explicitly rather than imported transitively, so a
//! step that forgets to check it is visible at the call site, not buried in
//! a global.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::store::models::DocumentId;

#[derive(Clone)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct CancellationGate {
    handles: DashMap<DocumentId, Arc<AtomicBool>>,
}

impl CancellationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_for(&self, document_id: DocumentId) -> CancellationHandle {
        let flag = self
            .handles
            .entry(document_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        CancellationHandle { flag }
    }

    /// Marks the document cancelled even if ingestion has not registered a
    /// handle yet, so a delete that races the pipeline's startup still wins.
    pub fn cancel(&self, document_id: DocumentId) {
        self.handles.entry(document_id).or_insert_with(|| Arc::new(AtomicBool::new(false))).store(true, Ordering::SeqCst);
    }

    /// Cleared only after the ingestion consumer has finished tearing down
    /// partial output for the document.
    pub fn clear(&self, document_id: DocumentId) {
        self.handles.remove(&document_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_visible_through_a_separately_obtained_handle() {
        let gate = CancellationGate::new();
        let doc_id = DocumentId::new();
        let handle_a = gate.handle_for(doc_id);
        let handle_b = gate.handle_for(doc_id);
        assert!(!handle_a.is_cancelled());
        gate.cancel(doc_id);
        assert!(handle_a.is_cancelled());
        assert!(handle_b.is_cancelled());
    }

    #[test]
    fn clearing_removes_the_handle_state() {
        let gate = CancellationGate::new();
        let doc_id = DocumentId::new();
        gate.cancel(doc_id);
        gate.clear(doc_id);
        let handle = gate.handle_for(doc_id);
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn cancel_before_the_pipeline_registers_a_handle_still_wins() {
        let gate = CancellationGate::new();
        let doc_id = DocumentId::new();
        gate.cancel(doc_id);
        let handle = gate.handle_for(doc_id);
        assert!(handle.is_cancelled());
    }
}
