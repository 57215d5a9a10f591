pub mod health;
pub mod metrics;

pub use health::{router, HealthState};
pub use metrics::AppMetrics;

pub use metrics::router as metrics_router;
