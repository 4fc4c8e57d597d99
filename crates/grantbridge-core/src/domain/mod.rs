//! Canonical record types shared by every source adapter.

mod grant;
mod timestamp;

pub use grant::{CanonicalGrantRecord, DateFormat, Deadline, GrantStatus};
pub use timestamp::UtcDateTime;
