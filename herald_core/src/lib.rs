//! # Herald
//!
//! Realtime subscription multiplexing across the tabs (processes) of one origin.
//!
//! Many components register listeners for "rows of table T matching filter F changed". Herald
//! folds equal registrations into one subscription key, elects a single leader per key across
//! tabs through a lease kept in a shared key-value store, and relays the leader's change events
//! to every other tab over a broadcast bus.
//!
//! The browser-side primitives (shared storage, broadcast channels, the backend change-feed)
//! are traits so that the coordination logic can run against any implementation. See the
//! `herald_mem` crate for in-memory implementations.

#![deny(missing_docs)]

pub mod bus;
pub mod clock;
pub mod event;
pub mod feed;
pub mod filter;
pub mod listener;
pub mod lock;
pub mod multiplexer;
pub mod store;

pub mod prelude {
    //! The prelude module for the `herald_core` crate.
    pub use super::bus::{
        BroadcastChannel, BusEndpoint, BusError, BusMessage, BusStream, ControlSignal, CrossTabBus,
    };
    pub use super::clock::{Clock, SystemClock};
    pub use super::event::{ChangeEvent, EventKind, Row};
    pub use super::feed::{ChangeFeed, ChangeFeedError, ChangeStream, SubscriptionRequest};
    pub use super::filter::{Filter, FilterError, encode_filter, subscription_key};
    pub use super::listener::{ChangeHandler, HandlerError, ListenerId, ListenerRequest};
    pub use super::lock::{LeaderLock, LockRecord};
    pub use super::multiplexer::{
        Backends, ChannelStatus, ConfigError, Multiplexer, MultiplexerConfig,
    };
    pub use super::store::{SharedStore, StoreError};
}
