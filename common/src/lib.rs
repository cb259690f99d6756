pub mod api;
pub mod error;
pub mod store;
pub mod types;

pub use api::*;
pub use error::{ClusterError, Result};
pub use store::{CoordinationStore, ExpirationStream};
pub use types::*;
