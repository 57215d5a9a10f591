pub mod dlq;
pub mod pipeline;
pub mod processor;
pub mod recovery;

pub use dlq::DlqManager;
pub use pipeline::ConsumerPipeline;
pub use processor::EmailProcessor;
pub use recovery::{ConnectionWatchdog, OrphanRecovery};
