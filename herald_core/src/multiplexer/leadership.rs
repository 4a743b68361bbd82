//! Leadership lifecycle of a channel record.
//!
//! A record becomes leader by taking the lease and then opening the backend connection. While
//! leading, a heartbeat renews the lease and the relay task forwards every change event to the
//! local listeners and to the other tabs. A follower watches the lease and reacts to
//! `leader_left` so that a departed or crashed leader is replaced.

use super::Inner;
use super::channel::ChannelRecord;
use crate::feed::ChangeStream;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_stream::StreamExt;

/// Takes the lease for a record that claimed an attempt and, if granted, opens the backend
/// connection.
pub(crate) async fn attempt(inner: Arc<Inner>, key: String, generation: u64) {
    let acquired = inner.lock.try_acquire(&inner.config.lock_key(&key));

    let request = {
        let mut state = inner.lock_state();
        let Some(record) = Inner::record_mut(&mut state, &key, generation) else {
            drop(state);
            if acquired {
                inner.release_unless_leading(&key);
            }
            return;
        };
        if !acquired {
            record.acquiring = false;
            log::debug!("Tab {} follows '{}'", inner.tab_id, key);
            inner.ensure_watchdog(record);
            return;
        }
        record.is_leader = true;
        record.stop_watchdog();
        record.request.clone()
    };

    log::info!(
        "Tab {} leads '{}', opening change-feed connection",
        inner.tab_id,
        key
    );
    let stream = match inner.feed.subscribe(request).await {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!(
                "Failed to open change-feed connection for '{}', releasing leadership: {}",
                key,
                e
            );
            {
                let mut state = inner.lock_state();
                if let Some(record) = Inner::record_mut(&mut state, &key, generation) {
                    record.acquiring = false;
                    record.is_leader = false;
                    record.connect_failed = true;
                }
            }
            inner.release_unless_leading(&key);
            return;
        }
    };

    let mut state = inner.lock_state();
    let Some(record) = Inner::record_mut(&mut state, &key, generation).filter(|r| r.is_leader)
    else {
        drop(state);
        log::debug!(
            "Channel '{}' went away while connecting, closing the new connection",
            key
        );
        drop(stream);
        inner.release_unless_leading(&key);
        return;
    };
    let weak = Arc::downgrade(&inner);
    record.acquiring = false;
    record.subscribed = true;
    record.connection = Some(inner.runtime.spawn(relay(
        weak.clone(),
        key.clone(),
        generation,
        stream,
    )));
    record.heartbeat = Some(inner.runtime.spawn(heartbeat(
        weak,
        key,
        generation,
        inner.config.refresh_interval,
    )));
}

/// Forwards events from the backend connection, in order, to the bus and the local listeners.
async fn relay(inner: Weak<Inner>, key: String, generation: u64, mut stream: ChangeStream) {
    while let Some(event) = stream.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(&key, generation, &event, true);
    }
    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(&key, generation);
    }
}

async fn heartbeat(inner: Weak<Inner>, key: String, generation: u64, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.renew_lease(&key, generation) {
            return;
        }
    }
}

/// Follower side: periodically checks whether the lease became free, e.g. because the leader
/// tab crashed without announcing it.
async fn watch_lease(inner: Weak<Inner>, key: String, generation: u64, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.lease_available(&key) && inner.claim_attempt(&key, generation) {
            log::info!(
                "Lease for '{}' is free, tab {} attempting takeover",
                key,
                inner.tab_id
            );
            inner
                .runtime
                .spawn(attempt(inner.clone(), key.clone(), generation));
        }
    }
}

impl Inner {
    fn claim_attempt(&self, key: &str, generation: u64) -> bool {
        let mut state = self.lock_state();
        Self::record_mut(&mut state, key, generation).is_some_and(ChannelRecord::claim_attempt)
    }

    fn lease_available(&self, key: &str) -> bool {
        match self.lock.holder(&self.config.lock_key(key)) {
            Ok(Some(holder)) => !self.lock.is_held_by_other(&holder),
            Ok(None) => true,
            // try_acquire treats an unusable store as granted
            Err(_) => true,
        }
    }

    /// Releases the lease unless a current record for `key` is leading or about to.
    fn release_unless_leading(&self, key: &str) {
        let leading = self
            .lock_state()
            .channels
            .get(key)
            .is_some_and(|r| r.is_leader || r.acquiring);
        if !leading {
            self.lock.release(&self.config.lock_key(key));
        }
    }

    pub(super) fn ensure_watchdog(self: &Arc<Self>, record: &mut ChannelRecord) {
        if record.watchdog.is_some() || !record.may_connect() {
            return;
        }
        record.watchdog = Some(self.runtime.spawn(watch_lease(
            Arc::downgrade(self),
            record.key.clone(),
            record.generation,
            self.config.refresh_interval,
        )));
    }

    /// Renews the lease from the heartbeat. Returns false when the heartbeat should stop.
    ///
    /// If another tab holds an unexpired lease (both stole an expired lease at the same time),
    /// this tab steps down instead of overwriting it, so duplicate leadership lasts at most one
    /// refresh interval.
    fn renew_lease(self: &Arc<Self>, key: &str, generation: u64) -> bool {
        let mut state = self.lock_state();
        let Some(record) = Self::record_mut(&mut state, key, generation) else {
            return false;
        };
        if !record.is_leader {
            return false;
        }
        match self.lock.holder(&record.lock_key) {
            Ok(Some(holder)) if self.lock.is_held_by_other(&holder) => {
                log::warn!(
                    "Tab {} lost the lease on '{}' to tab {}, stepping down",
                    self.tab_id,
                    key,
                    holder.owner_id
                );
                // Detach our own handle so that stepping down does not abort this task.
                record.heartbeat.take();
                record.stop_leading();
                self.ensure_watchdog(record);
                return false;
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not read lease for '{}' before refresh: {}", key, e),
        }
        if let Err(e) = self.lock.refresh(&record.lock_key) {
            log::warn!("Failed to refresh lease for '{}': {}", key, e);
        }
        true
    }

    /// The backend closed the connection while this tab was leading.
    fn connection_lost(self: &Arc<Self>, key: &str, generation: u64) {
        let mut state = self.lock_state();
        let Some(record) = Self::record_mut(&mut state, key, generation) else {
            return;
        };
        if !record.subscribed {
            return;
        }
        log::warn!(
            "Change-feed connection for '{}' ended, giving up leadership",
            key
        );
        record.connection.take();
        record.resign(&self.lock);
        self.ensure_watchdog(record);
    }

    /// Another tab announced it stopped leading `key`; try to take over after a random delay.
    pub(super) fn on_leader_left(self: &Arc<Self>, key: &str, generation: u64) {
        {
            let mut state = self.lock_state();
            let Some(record) = Self::record_mut(&mut state, key, generation) else {
                return;
            };
            if record.is_leader || !record.may_connect() {
                return;
            }
        }
        let delay = self.config.takeover_backoff();
        log::debug!(
            "Leader of '{}' left, tab {} attempting takeover in {:?}",
            key,
            self.tab_id,
            delay
        );
        let weak = Arc::downgrade(self);
        let key = key.to_string();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.claim_attempt(&key, generation) {
                attempt(inner, key, generation).await;
            }
        });
    }
}
