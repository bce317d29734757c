use detector::clock::VirtualClock;
use detector::{Detector, DetectorConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const BOUND: Duration = Duration::from_secs(1);

fn config() -> DetectorConfig {
    DetectorConfig::new(Duration::from_millis(100), Duration::from_millis(10))
}

#[tokio::test]
async fn stop_without_any_event_completes() {
    let clock = Arc::new(VirtualClock::new());
    let mut det = Detector::with_clock(config(), clock.clone());
    let mut events = det.start();
    timeout(BOUND, clock.wait_for_sleepers(2)).await.unwrap();

    timeout(BOUND, det.stop()).await.expect("stop deadlocked");
    assert_eq!(events.recv().await, None);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let clock = Arc::new(VirtualClock::new());
    let mut det = Detector::with_clock(config(), clock);
    let _events = det.start();
    timeout(BOUND, det.stop()).await.unwrap();
    timeout(BOUND, det.stop()).await.unwrap();
}

#[tokio::test]
async fn stop_before_start_returns() {
    let mut det = Detector::with_clock(config(), Arc::new(VirtualClock::new()));
    timeout(BOUND, det.stop()).await.unwrap();
}

#[tokio::test]
async fn stop_on_system_clock() {
    let mut det = Detector::new(Duration::from_millis(100), Duration::from_millis(10));
    let mut events = det.start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    timeout(BOUND, det.stop()).await.unwrap();
    assert_eq!(events.recv().await, None);
}

#[tokio::test]
async fn stop_while_pairing() {
    let clock = Arc::new(VirtualClock::new());
    let mut det = Detector::with_clock(config(), clock.clone());
    let mut events = det.start();

    // settle, then let only leg 1 drift so the merge stage waits on its timer
    for by in [50, 50, 90] {
        timeout(BOUND, clock.wait_for_sleepers(2)).await.unwrap();
        clock.advance(Duration::from_millis(by));
    }
    timeout(BOUND, clock.wait_for_timers(1)).await.unwrap();

    timeout(BOUND, det.stop()).await.expect("stop deadlocked while pairing");
    assert_eq!(events.recv().await, None);
    assert_eq!(det.metrics().events(), 0);
}

#[tokio::test]
async fn stop_while_consumer_is_not_reading() {
    let clock = Arc::new(VirtualClock::new());
    let mut det = Detector::with_clock(config(), clock.clone());
    let mut events = det.start();

    // first wake waits on the consumer, the second fills the raw queue
    for _ in 0..2 {
        timeout(BOUND, clock.wait_for_sleepers(2)).await.unwrap();
        clock.advance(Duration::from_secs(3_600));
    }
    // the third leaves both legs blocked publishing their reports
    timeout(BOUND, clock.wait_for_sleepers(2)).await.unwrap();
    clock.advance(Duration::from_secs(3_600));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let m = det.metrics();
    assert_eq!(m.raw_reports, 4);
    assert_eq!(m.paired_events, 1);
    assert_eq!(clock.sleeper_count(), 0, "legs should be stuck on the full queue");

    timeout(BOUND, det.stop()).await.expect("stop deadlocked on back-pressure");
    assert_eq!(det.metrics().raw_reports, 4);
    // the unread event is not delivered after stop
    assert_eq!(events.recv().await, None);
}

#[tokio::test]
async fn dropped_consumer_ends_session() {
    let clock = Arc::new(VirtualClock::new());
    let mut det = Detector::with_clock(config(), clock.clone());
    drop(det.start());

    timeout(BOUND, clock.wait_for_sleepers(2)).await.unwrap();
    clock.advance(Duration::from_secs(3_600));
    timeout(BOUND, det.stop()).await.unwrap();
}

#[tokio::test]
async fn second_start_is_closed() {
    let clock = Arc::new(VirtualClock::new());
    let mut det = Detector::with_clock(config(), clock.clone());
    let _first = det.start();
    let mut second = det.start();
    assert_eq!(timeout(BOUND, second.recv()).await.unwrap(), None);
    det.stop().await;
}

#[tokio::test]
async fn dropping_detector_releases_legs() {
    let clock = Arc::new(VirtualClock::new());
    let mut det = Detector::with_clock(config(), clock.clone());
    let mut events = det.start();
    timeout(BOUND, clock.wait_for_sleepers(2)).await.unwrap();

    drop(det);

    timeout(BOUND, async {
        while clock.sleeper_count() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("legs kept sleeping after drop");
    assert_eq!(timeout(BOUND, events.recv()).await.unwrap(), None);
}
