//! # Herald memory backends
//!
//! In-memory implementations of herald's boundaries, primarily for testing and for running
//! several tabs inside one process:
//!
//! * [`InMemorySharedStore`], the shared key-value store holding leases
//! * [`InMemoryBroadcastHub`], the cross-tab bus
//! * [`InMemoryChangeFeed`], a scriptable change-feed that applies server filters
//! * [`TokioClock`], wall-clock time that follows Tokio's (possibly paused) clock
//!
//! Every tab built over the same store, hub and feed behaves like a tab of the same origin:
//!
//! ```ignore
//! let store = Arc::new(InMemorySharedStore::new());
//! let hub = Arc::new(InMemoryBroadcastHub::new());
//! let feed = Arc::new(InMemoryChangeFeed::new());
//! let clock = Arc::new(TokioClock::new());
//!
//! let backends = Backends::new(store, hub, feed.clone()).with_clock(clock);
//! let first = Multiplexer::new(backends.clone());
//! let second = Multiplexer::new(backends);
//! ```

#![deny(missing_docs)]

mod bus;
mod clock;
mod feed;
mod store;

pub use bus::*;
pub use clock::*;
pub use feed::*;
pub use store::*;
