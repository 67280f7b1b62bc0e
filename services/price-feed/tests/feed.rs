//! End-to-end tests for the price feed
//!
//! Drives the producer against real registries, stores and calendar files:
//! - Fan-out ordering across many connections
//! - Pruning of closed connections
//! - Loop survival without a calendar file, and clean shutdown
//! - Journal-backed history across restarts

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use persistence::{JournalConfig, JournalStore, MemoryStore, PriceStore, RangeQuery};
use price_feed::{
    ConnectionRegistry, FileCalendar, ProducerConfig, ProducerPhase, StaticCalendar,
    ValueProducer,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

const LECTURE: &str = "BEGIN:VCALENDAR\r\n\
    BEGIN:VEVENT\r\n\
    DTSTART:20240930T090000\r\n\
    DTEND:20240930T100000\r\n\
    END:VEVENT\r\n\
    END:VCALENDAR\r\n";

fn seeded() -> ProducerConfig {
    ProducerConfig {
        rng_seed: Some(42),
        ..ProducerConfig::default()
    }
}

fn at(secs: u32) -> DateTime<FixedOffset> {
    (Utc.with_ymd_and_hms(2024, 9, 30, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs as i64))
        .into()
}

fn price_of(payload: &str) -> f64 {
    let json: serde_json::Value = serde_json::from_str(payload).unwrap();
    json["price"].as_f64().unwrap()
}

#[tokio::test]
async fn every_connection_receives_every_value_in_order() {
    let registry = ConnectionRegistry::default();
    let mut receivers = Vec::new();
    for _ in 0..4 {
        let (tx, rx) = mpsc::channel::<Arc<str>>(64);
        registry.subscribe(tx);
        receivers.push(rx);
    }

    let mut producer = ValueProducer::new(
        seeded(),
        Arc::new(StaticCalendar::new(LECTURE)),
        Arc::new(MemoryStore::new()),
        registry.clone(),
    )
    .unwrap();

    let mut produced = Vec::new();
    for s in 0..20 {
        let report = producer.tick_at(at(s)).await.unwrap();
        assert_eq!(report.broadcast.delivered, 4);
        produced.push(report.point.price);
    }

    for rx in &mut receivers {
        let mut got = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            got.push(price_of(&payload));
        }
        assert_eq!(got, produced);
    }
}

#[tokio::test]
async fn closed_connection_is_pruned_on_next_broadcast() {
    let registry = ConnectionRegistry::default();
    let (tx_a, mut rx_a) = mpsc::channel::<Arc<str>>(8);
    let (tx_b, rx_b) = mpsc::channel::<Arc<str>>(8);
    let (tx_c, mut rx_c) = mpsc::channel::<Arc<str>>(8);
    registry.subscribe(tx_a);
    let closed = registry.subscribe(tx_b);
    registry.subscribe(tx_c);

    drop(rx_b);

    let mut producer = ValueProducer::new(
        seeded(),
        Arc::new(StaticCalendar::default()),
        Arc::new(MemoryStore::new()),
        registry.clone(),
    )
    .unwrap();

    let report = producer.tick_at(at(0)).await.unwrap();
    assert_eq!(report.broadcast.attempted, 3);
    assert_eq!(report.broadcast.delivered, 2);
    assert_eq!(report.broadcast.dropped, vec![closed.id()]);
    assert_eq!(registry.connection_count(), 2);
    assert!(rx_a.try_recv().is_ok());
    assert!(rx_c.try_recv().is_ok());

    let report = producer.tick_at(at(1)).await.unwrap();
    assert_eq!(report.broadcast.attempted, 2);
    assert_eq!(registry.connection_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn loop_keeps_running_without_calendar_and_stops_on_shutdown() {
    let tmp = TempDir::new().unwrap();
    let calendar = Arc::new(FileCalendar::new(tmp.path().join("schedule.ics")));
    let store = Arc::new(MemoryStore::new());
    let registry = ConnectionRegistry::default();
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(64);
    registry.subscribe(tx);

    let handle = ValueProducer::new(seeded(), calendar, store.clone(), registry.clone())
        .unwrap()
        .spawn();

    for _ in 0..3 {
        let payload = rx.recv().await.unwrap();
        let price = price_of(&payload);
        assert!((5.01..=6.5).contains(&price), "price {price} out of range");
    }

    let producer = handle.shutdown().await.unwrap();
    assert_eq!(producer.phase(), ProducerPhase::Stopped);
    assert_eq!(producer.coefficient_state().last_egorov, Some(1.0));

    let produced = store.len();
    assert!(produced >= 3);
    assert!(registry.metrics().snapshot().calendar_failures >= 3);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.len(), produced);
}

#[tokio::test]
async fn journal_history_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let mut prices = Vec::new();

    {
        let store = Arc::new(JournalStore::open(JournalConfig::new(tmp.path())).unwrap());
        let mut producer = ValueProducer::new(
            seeded(),
            Arc::new(StaticCalendar::new(LECTURE)),
            store.clone(),
            ConnectionRegistry::default(),
        )
        .unwrap();

        for s in 0..10 {
            prices.push(producer.tick_at(at(s)).await.unwrap().point.price);
        }
        store.sync().unwrap();
    }

    let store = JournalStore::open(JournalConfig::new(tmp.path())).unwrap();
    let history = store.range(&RangeQuery::default()).unwrap();
    let stored: Vec<f64> = history.iter().map(|p| p.price).collect();
    assert_eq!(stored, prices);

    let window = store
        .range(&RangeQuery::new(
            Some(at(3).with_timezone(&Utc)),
            Some(at(5).with_timezone(&Utc)),
        ))
        .unwrap();
    assert_eq!(window.len(), 3);
    assert_eq!(store.latest().unwrap().map(|p| p.price), prices.last().copied());
}
