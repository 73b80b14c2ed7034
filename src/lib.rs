//! # Last Price
//!
//! An in-memory last-value cache with conflating fan-out subscriptions.
//!
//! ## Core Concepts
//!
//! - **Store**: The latest value per key, with a per-key version that strictly increases
//! - **Mailboxes**: One pending record per subscriber and key; newer replaces older
//! - **Attach**: Register first, then snapshot, then reconcile by version
//! - **Dispatch**: One delivery loop per subscriber, woken only when a mailbox fills
//! - **Batch runs**: Staged uploads that publish on completion
//!
//! ## Example
//!
//! ```ignore
//! use lastprice::{KeyFilter, LastPriceService, ProducerId, ServiceConfig, Timestamp};
//!
//! let service = LastPriceService::new(ServiceConfig::default().with_default_instruments())?;
//! let feed = ProducerId::new("feed-1");
//!
//! service.publish(&feed, "AIR", b"101.50".to_vec(), Timestamp(0))?;
//!
//! // Snapshot of AIR first, then live updates as they arrive
//! let (handle, updates) = service.attach_channel(KeyFilter::keys(["AIR"]))?;
//! service.publish(&feed, "AIR", b"101.75".to_vec(), Timestamp(0))?;
//!
//! for update in updates.iter().take(2) {
//!     println!("{} v{} {:?}", update.key(), update.version(), update.origin);
//! }
//! service.detach(handle.id())?;
//! ```

pub mod batches;
pub mod broadcaster;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mailbox;
pub mod service;
pub mod store;
pub mod subscriptions;
pub mod telemetry;
pub mod types;
pub mod validation;

// Re-exports
pub use batches::{BatchRun, BatchRunRepository};
pub use broadcaster::{Attachment, BroadcastStats, Broadcaster};
pub use clock::{EpochClock, ManualClock, SystemClock};
pub use config::{ServiceConfig, DEFAULT_INSTRUMENTS};
pub use dispatch::{channel_sink, ChannelSink, DispatchHandle, DispatchLoop, LoopState, UpdateSink};
pub use error::{LastPriceError, Result, SinkError};
pub use mailbox::{ConflatingMailbox, OfferOutcome};
pub use service::{LastPriceService, ServiceStats};
pub use store::LastValueStore;
pub use subscriptions::{DetachReason, Subscription, SubscriptionRegistry};
pub use telemetry::{LatencyHistogram, LatencyRecorder, LatencySummary, NoopLatencyRecorder};
pub use types::*;
pub use validation::IngressValidator;
