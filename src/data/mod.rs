pub mod error;
pub mod state;
pub mod stream;

pub use error::{ImapError, StateError, StreamStoreError};
pub use state::MailboxStateStore;
pub use stream::{PendingEntry, StreamMessage, StreamStore};
