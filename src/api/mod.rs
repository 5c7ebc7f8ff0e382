pub mod ig_client;
pub mod quota;
pub mod types;

pub use ig_client::{DealingError, IgClient, IgCredentials};
pub use quota::{QuotaTracker, RequestKind};
