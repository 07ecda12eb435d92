pub mod reconciler;

pub use reconciler::{PendingResponse, StreamPhase, StreamReconciler};
