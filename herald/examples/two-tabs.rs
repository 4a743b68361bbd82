//! Two tabs of the same origin watching the same report. Only one opens a change-feed
//! connection; when it closes, the other takes over.

use herald::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn printer(tab: &'static str) -> impl Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync {
    move |event: &ChangeEvent| {
        log::info!("[{}] {} {:?}", tab, event.kind, event.new);
        Ok(())
    }
}

fn report_items(tab: &'static str) -> ListenerRequest {
    ListenerRequest::new("report-items", printer(tab))
        .table("report_items")
        .filter(Filter::new().eq("report_id", "R1"))
}

fn item(id: i64) -> ChangeEvent {
    let row = json!({"id": id, "report_id": "R1"});
    ChangeEvent::insert(row.as_object().cloned().unwrap_or_default()).on_table("report_items")
}

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let feed = Arc::new(InMemoryChangeFeed::new());
    let backends = Backends::new(
        Arc::new(InMemorySharedStore::new()),
        Arc::new(InMemoryBroadcastHub::new()),
        feed.clone(),
    )
    .with_clock(Arc::new(TokioClock::new()));

    let first = Multiplexer::new(backends.clone());
    let second = Multiplexer::new(backends);
    let key = subscription_key("report-items", Some(&Filter::new().eq("report_id", "R1")));

    first.add_listener(report_items("first"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    second.add_listener(report_items("second"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    log::info!("Connections opened: {}", feed.connections_opened());
    feed.emit(item(1));
    tokio::time::sleep(Duration::from_millis(50)).await;

    first.shutdown();
    tokio::time::sleep(Duration::from_secs(1)).await;
    log::info!("Second tab status after handover: {:?}", second.status(&key));

    feed.emit(item(2));
    tokio::time::sleep(Duration::from_millis(50)).await;
    log::info!("Connections opened: {}", feed.connections_opened());

    second.shutdown();
}
