use super::Inner;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Starts the periodic idle sweep. The task stops on its own once the tab is dropped.
pub(crate) fn spawn(inner: &Arc<Inner>, period: Duration) -> JoinHandle<()> {
    inner.runtime.spawn(run(Arc::downgrade(inner), period))
}

async fn run(inner: Weak<Inner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let reaped = inner.sweep_idle();
        if reaped > 0 {
            log::debug!("Idle sweep of tab {} reaped {} channels", inner.tab_id, reaped);
        }
    }
}
