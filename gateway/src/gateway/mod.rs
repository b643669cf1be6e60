//! Request routing between authenticated callers and the model backend.
//!
//! This module provides:
//! - Admission control bounding concurrent backend calls
//! - Retry with exponential backoff for unavailable backends
//! - Per-session rate limiting
//! - The chat router and its streaming relay

pub mod admission;
pub mod call;
pub mod rate_limit;
pub mod retry;
pub mod router;

pub use admission::{AdmissionControl, AdmissionPolicy};
pub use call::CallState;
pub use rate_limit::SessionRateLimiter;
pub use retry::RetryPolicy;
pub use router::{ChatRouter, RelayFrame, RelayStream, RouterSettings};
