//! Per-key channel records.

use crate::bus::{BroadcastChannel, BusMessage};
use crate::event::ChangeEvent;
use crate::feed::SubscriptionRequest;
use crate::listener::Listener;
use crate::lock::LeaderLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A snapshot of one channel record, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    /// The subscription key.
    pub key: String,
    /// Number of registered listeners in this tab.
    pub listeners: usize,
    /// Whether this tab holds the lease for the key.
    pub is_leader: bool,
    /// Whether this tab holds a live backend connection for the key.
    pub subscribed: bool,
    /// Time since the record last saw a registration, removal or event.
    pub idle_for: Duration,
}

/// This tab's endpoint on the key's bus topic and the task draining it.
pub(crate) struct BusLink {
    pub channel: Box<dyn BroadcastChannel>,
    pub pump: JoinHandle<()>,
}

/// Everything this tab knows about one subscription key.
///
/// `subscribed` implies `is_leader`, which implies the lease was acquired by this tab. Background
/// tasks are owned here and aborted when the record is dropped.
pub(crate) struct ChannelRecord {
    pub key: String,
    pub lock_key: String,
    pub generation: u64,
    pub request: SubscriptionRequest,
    pub listeners: Vec<Listener>,
    pub is_leader: bool,
    pub subscribed: bool,
    pub acquiring: bool,
    pub connect_failed: bool,
    pub connection: Option<JoinHandle<()>>,
    pub heartbeat: Option<JoinHandle<()>>,
    pub watchdog: Option<JoinHandle<()>>,
    pub bus: Option<BusLink>,
    pub last_activity: Instant,
}

impl ChannelRecord {
    pub fn new(
        key: String,
        lock_key: String,
        generation: u64,
        request: SubscriptionRequest,
    ) -> Self {
        Self {
            key,
            lock_key,
            generation,
            request,
            listeners: Vec::new(),
            is_leader: false,
            subscribed: false,
            acquiring: false,
            connect_failed: false,
            connection: None,
            heartbeat: None,
            watchdog: None,
            bus: None,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Returns true if any listener is allowed to open a backend connection.
    pub fn may_connect(&self) -> bool {
        self.listeners.iter().any(|l| l.may_connect)
    }

    /// Marks a leadership attempt as started if one is allowed right now.
    pub fn claim_attempt(&mut self) -> bool {
        if self.is_leader || self.acquiring || self.connect_failed || !self.may_connect() {
            return false;
        }
        self.acquiring = true;
        true
    }

    /// Listeners that should receive `event`, cloned so they can be invoked without the
    /// registry lock.
    pub fn interested(&self, event: &ChangeEvent) -> Vec<Listener> {
        self.listeners
            .iter()
            .filter(|l| l.wants(event))
            .cloned()
            .collect()
    }

    pub fn post(&self, message: &BusMessage) {
        let Some(bus) = &self.bus else {
            return;
        };
        match message.to_wire() {
            Ok(wire) => self.post_raw(bus, &wire),
            Err(e) => log::error!("Failed to encode bus message for '{}': {}", self.key, e),
        }
    }

    pub fn post_event(&self, event: &ChangeEvent) {
        let Some(bus) = &self.bus else {
            return;
        };
        match BusMessage::event_wire(event) {
            Ok(wire) => self.post_raw(bus, &wire),
            Err(e) => log::error!("Failed to encode event for '{}': {}", self.key, e),
        }
    }

    fn post_raw(&self, bus: &BusLink, wire: &str) {
        if let Err(e) = bus.channel.post(wire) {
            log::warn!("Failed to post to bus for '{}': {}", self.key, e);
        }
    }

    /// Closes the connection and stops the heartbeat. The lease is left untouched.
    pub fn stop_leading(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.is_leader = false;
        self.subscribed = false;
    }

    pub fn stop_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }

    /// Gives up leadership gracefully: closes the connection, releases the lease and tells the
    /// other tabs.
    pub fn resign(&mut self, lock: &LeaderLock) {
        self.stop_leading();
        lock.release(&self.lock_key);
        self.post(&BusMessage::leader_left());
    }

    /// Final teardown when the record leaves the registry.
    pub fn teardown(mut self, lock: &LeaderLock) {
        if self.is_leader {
            log::info!("Releasing leadership of '{}'", self.key);
            self.resign(lock);
        }
        log::debug!("Tearing down channel '{}'", self.key);
        // Remaining tasks and the bus endpoint are closed by Drop.
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            key: self.key.clone(),
            listeners: self.listeners.len(),
            is_leader: self.is_leader,
            subscribed: self.subscribed,
            idle_for: self.last_activity.elapsed(),
        }
    }
}

impl Drop for ChannelRecord {
    fn drop(&mut self) {
        self.stop_leading();
        self.stop_watchdog();
        if let Some(bus) = self.bus.take() {
            bus.pump.abort();
            bus.channel.close();
        }
    }
}
