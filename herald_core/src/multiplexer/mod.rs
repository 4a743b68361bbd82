//! The channel registry and its public API.
//!
//! A [`Multiplexer`] is one tab. It keeps one [`ChannelStatus`]-reportable record per
//! subscription key, owning that key's listeners, its bus endpoint and, while this tab leads
//! the key, the backend connection. Several multiplexers built over the same store, bus and
//! feed behave like several tabs of one origin.
//!
//! ```rust,ignore
//! let tab = Multiplexer::new(Backends::new(store, bus, feed));
//!
//! let id = tab.add_listener(
//!     ListenerRequest::new("report-items", |event: &ChangeEvent| {
//!         println!("{:?}", event.new);
//!         Ok(())
//!     })
//!     .table("report_items")
//!     .filter(Filter::new().eq("report_id", "R1")),
//! );
//!
//! // ... later
//! tab.remove_listener("report-items", &id, Some(&Filter::new().eq("report_id", "R1")));
//! ```
//!
//! # Locking
//!
//! The registry state sits behind a synchronous mutex that is never held across an `.await` or
//! while handlers run, so handlers may call back into the multiplexer.

mod channel;
mod config;
mod leadership;
mod reaper;

pub use channel::ChannelStatus;
pub use config::{ConfigError, MultiplexerConfig};

use crate::bus::{BusMessage, BusStream, ControlSignal, CrossTabBus};
use crate::clock::{Clock, SystemClock};
use crate::event::{ChangeEvent, EventKind};
use crate::feed::{ChangeFeed, SubscriptionRequest};
use crate::filter::{Filter, encode_filter, subscription_key};
use crate::listener::{Listener, ListenerId, ListenerRequest};
use crate::lock::LeaderLock;
use crate::store::SharedStore;
use channel::{BusLink, ChannelRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// The collaborators a tab coordinates through.
#[derive(Clone)]
pub struct Backends {
    /// Shared persistent store holding the leases.
    pub store: Arc<dyn SharedStore>,
    /// Broadcast primitive used to relay events between tabs.
    pub bus: Arc<dyn CrossTabBus>,
    /// The backend change-feed.
    pub feed: Arc<dyn ChangeFeed>,
    /// Clock stamping the leases.
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Bundles the collaborators, using the system clock.
    pub fn new(
        store: Arc<dyn SharedStore>,
        bus: Arc<dyn CrossTabBus>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self {
            store,
            bus,
            feed,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

struct RegistryState {
    channels: HashMap<String, ChannelRecord>,
    next_generation: u64,
    reaper: Option<JoinHandle<()>>,
}

pub(crate) struct Inner {
    tab_id: String,
    config: MultiplexerConfig,
    lock: LeaderLock,
    bus: Arc<dyn CrossTabBus>,
    feed: Arc<dyn ChangeFeed>,
    runtime: Handle,
    state: Mutex<RegistryState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // An abandoned tab behaves like a closed browser tab: tasks stop, leases are left to
        // expire.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(reaper) = state.reaper.take() {
            reaper.abort();
        }
    }
}

/// One tab's realtime subscription multiplexer.
///
/// Cheap to clone; clones share the same registry. Dropping every clone without calling
/// [`shutdown`](Self::shutdown) stops all background work but leaves leases to expire, the
/// way a crashed tab would.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("tab_id", &self.inner.tab_id)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Multiplexer {
    /// Creates a tab with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(backends: Backends) -> Self {
        Self::build(backends, MultiplexerConfig::default())
    }

    /// Creates a tab with a custom configuration.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_config(backends: Backends, config: MultiplexerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(backends, config))
    }

    fn build(backends: Backends, config: MultiplexerConfig) -> Self {
        let tab_id = Uuid::new_v4().to_string();
        let lock = LeaderLock::new(
            backends.store,
            backends.clock,
            tab_id.clone(),
            config.lock_expiry,
        );
        let runtime = Handle::current();
        let reap_interval = config.reap_interval;
        let inner = Arc::new(Inner {
            tab_id,
            config,
            lock,
            bus: backends.bus,
            feed: backends.feed,
            runtime,
            state: Mutex::new(RegistryState {
                channels: HashMap::new(),
                next_generation: 0,
                reaper: None,
            }),
        });
        let reaper = reaper::spawn(&inner, reap_interval);
        inner.lock_state().reaper = Some(reaper);
        log::debug!("Created multiplexer for tab {}", inner.tab_id);
        Self { inner }
    }

    /// This tab's identifier, as written into the leases it holds.
    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    /// The configuration in use.
    pub fn config(&self) -> &MultiplexerConfig {
        &self.inner.config
    }

    /// Registers a listener and returns its id immediately.
    ///
    /// The first registration for a subscription key creates its channel record and opens the
    /// key's bus endpoint. Whenever the key is not led by this tab and the registration may
    /// connect (it has a filter or sets `allow_global`), a leadership attempt starts in the
    /// background; if it succeeds this tab opens the key's only backend connection.
    pub fn add_listener(&self, request: ListenerRequest) -> ListenerId {
        let key = subscription_key(&request.channel_name, request.filter.as_ref());
        let listener = Listener::from_request(&request);
        let id = listener.id;
        let may_connect = listener.may_connect;

        let mut state = self.inner.lock_state();
        if !state.channels.contains_key(&key) {
            let record = self.inner.create_record(&mut state, &key, &request);
            state.channels.insert(key.clone(), record);
        }
        let Some(record) = state.channels.get_mut(&key) else {
            return id;
        };

        record.listeners.push(listener);
        record.touch();
        if may_connect {
            record.connect_failed = false;
        } else if !record.may_connect() {
            log::warn!(
                "Listener {} on '{}' has no filter and allow_global is not set; it will not open a backend connection",
                id,
                key
            );
        }
        log::debug!(
            "Registered listener {} on '{}' ({} total)",
            id,
            key,
            record.listeners.len()
        );

        if record.claim_attempt() {
            let generation = record.generation;
            self.inner
                .runtime
                .spawn(leadership::attempt(self.inner.clone(), key, generation));
        }
        id
    }

    /// Removes a listener. `filter` must be the filter used at registration.
    ///
    /// Returns false, without side effects, if no such listener is registered. Removing the
    /// last listener of a key tears its record down: a leader closes the connection, releases
    /// the lease and announces `leader_left`.
    pub fn remove_listener(
        &self,
        channel_name: &str,
        listener_id: &ListenerId,
        filter: Option<&Filter>,
    ) -> bool {
        let key = subscription_key(channel_name, filter);
        let emptied = {
            let mut state = self.inner.lock_state();
            let Some(record) = state.channels.get_mut(&key) else {
                log::debug!("No channel '{}' for listener {}", key, listener_id);
                return false;
            };
            let Some(position) = record.listeners.iter().position(|l| l.id == *listener_id)
            else {
                log::debug!("Listener {} is not registered on '{}'", listener_id, key);
                return false;
            };
            record.listeners.remove(position);
            record.touch();
            log::debug!("Removed listener {} from '{}'", listener_id, key);
            if record.listeners.is_empty() {
                state.channels.remove(&key)
            } else {
                None
            }
        };
        if let Some(record) = emptied {
            record.teardown(&self.inner.lock);
        }
        true
    }

    /// Tears down every channel record, releasing all leadership held by this tab.
    pub fn remove_all(&self) {
        let records: Vec<ChannelRecord> = {
            let mut state = self.inner.lock_state();
            state.channels.drain().map(|(_, record)| record).collect()
        };
        log::info!("Removing all {} channels of tab {}", records.len(), self.inner.tab_id);
        for record in records {
            record.teardown(&self.inner.lock);
        }
    }

    /// Runs one idle sweep now. Returns the number of records torn down.
    pub fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle()
    }

    /// Graceful tab shutdown: tears everything down and stops the reaper.
    pub fn shutdown(&self) {
        self.remove_all();
        if let Some(reaper) = self.inner.lock_state().reaper.take() {
            reaper.abort();
        }
    }

    /// Subscription keys with a record in this tab.
    pub fn channel_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock_state().channels.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// A snapshot of the record for `key`.
    pub fn status(&self, key: &str) -> Option<ChannelStatus> {
        self.inner.lock_state().channels.get(key).map(ChannelRecord::status)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_record(
        self: &Arc<Self>,
        state: &mut RegistryState,
        key: &str,
        request: &ListenerRequest,
    ) -> ChannelRecord {
        state.next_generation += 1;
        let generation = state.next_generation;
        let subscription = SubscriptionRequest {
            channel_name: request.channel_name.clone(),
            table: request.table.clone(),
            schema: request
                .schema
                .clone()
                .unwrap_or_else(|| self.config.default_schema.clone()),
            event_kind: EventKind::Any,
            server_filter: encode_filter(request.filter.as_ref()),
        };
        let mut record = ChannelRecord::new(
            key.to_string(),
            self.config.lock_key(key),
            generation,
            subscription,
        );

        let topic = self.config.bus_topic(key);
        match self.bus.open(&topic) {
            Ok(endpoint) => {
                let pump = self.runtime.spawn(pump(
                    Arc::downgrade(self),
                    key.to_string(),
                    generation,
                    endpoint.messages,
                ));
                record.bus = Some(BusLink {
                    channel: endpoint.channel,
                    pump,
                });
            }
            Err(e) => {
                log::warn!(
                    "Failed to open bus topic '{}', events will not be shared across tabs: {}",
                    topic,
                    e
                );
            }
        }
        log::debug!("Created channel '{}' (generation {})", key, generation);
        record
    }

    fn record_mut<'a>(
        state: &'a mut RegistryState,
        key: &str,
        generation: u64,
    ) -> Option<&'a mut ChannelRecord> {
        state
            .channels
            .get_mut(key)
            .filter(|record| record.generation == generation)
    }

    /// Delivers `event` to every interested local listener of the record. When `relay` is set
    /// the event came from this tab's own connection and is also posted to the other tabs,
    /// unless the record has stepped down in the meantime.
    fn dispatch(&self, key: &str, generation: u64, event: &ChangeEvent, relay: bool) {
        let listeners = {
            let mut state = self.lock_state();
            let Some(record) = Self::record_mut(&mut state, key, generation) else {
                return;
            };
            record.touch();
            if relay && record.subscribed {
                record.post_event(event);
            }
            record.interested(event)
        };
        for listener in listeners {
            listener.deliver(event);
        }
    }

    fn sweep_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let reaped: Vec<ChannelRecord> = {
            let mut state = self.lock_state();
            let idle: Vec<String> = state
                .channels
                .values()
                .filter(|r| r.listeners.is_empty() && r.last_activity.elapsed() > idle_timeout)
                .map(|r| r.key.clone())
                .collect();
            idle.iter()
                .filter_map(|key| state.channels.remove(key))
                .collect()
        };
        let count = reaped.len();
        for record in reaped {
            log::info!("Reaping idle channel '{}'", record.key);
            record.teardown(&self.lock);
        }
        count
    }
}

/// Drains this tab's endpoint on a key's bus topic.
async fn pump(inner: Weak<Inner>, key: String, generation: u64, mut messages: BusStream) {
    while let Some(raw) = messages.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match BusMessage::parse(&raw) {
            Some(BusMessage::Event(event)) => inner.dispatch(&key, generation, &event, false),
            Some(BusMessage::Control {
                control: ControlSignal::LeaderLeft,
            }) => inner.on_leader_left(&key, generation),
            None => {}
        }
    }
    log::debug!("Bus stream for '{}' ended", key);
}
