//! Process-level plumbing: the rate-limit governor, the credit ledger,
//! retry with backoff, and cooperative shutdown.

pub mod credits;
pub mod rate_limiter;
pub mod retry;
pub mod shutdown;
