pub mod extractor;
pub mod reconciler;
pub mod reverse_sync;
