//! # Herald
//!
//! Realtime subscription multiplexing across the tabs of one origin: one backend change-feed
//! connection per subscription, shared by every tab through an elected leader.

#![deny(missing_docs)]

#[cfg(feature = "in-memory")]
/// In-memory backends for the `herald` crate.
pub mod mem {
    //! Contains the in-memory store, bus, change-feed and clock.
    pub use herald_mem::*;
}

pub mod prelude {
    //! The prelude module for the `herald` crate.
    pub use herald_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::*;
}
