pub mod cli;
pub mod config;
pub mod constants;
pub mod correlation;
pub mod logging;
pub mod shutdown;

pub use config::AppConfig;
pub use shutdown::ShutdownService;
