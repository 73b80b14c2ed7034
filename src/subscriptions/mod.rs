//! Subscription registry for live price fan-out.
//!
//! A subscription owns one conflating mailbox per key of interest plus a wake
//! channel its dispatch loop blocks on. The registry resolves which
//! subscriptions an update must be offered to.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new();
//! let id = registry.next_subscriber_id();
//! let sub = registry.subscribe(id, KeyFilter::keys(["AAPL"]), store.keys())?;
//!
//! for sub in registry.subscribers_for("AAPL") {
//!     sub.offer(&record);
//! }
//!
//! registry.unsubscribe(id, DetachReason::Unsubscribed)?;
//! ```

mod manager;
mod types;

pub use manager::SubscriptionRegistry;
pub(crate) use types::Signal;
pub use types::{DetachReason, Subscription};
