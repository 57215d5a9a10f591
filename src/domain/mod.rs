pub mod batch;
pub mod breaker;
pub mod email;
pub mod idempotency;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitBreakers, CircuitState};
pub use email::{DlqRecord, EmailRecord};
pub use idempotency::IdempotencyFilter;
pub use retry::RetryController;
