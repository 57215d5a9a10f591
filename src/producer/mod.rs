pub mod imap_client;
pub mod oauth;
pub mod pipeline;

pub use pipeline::ProducerPipeline;
