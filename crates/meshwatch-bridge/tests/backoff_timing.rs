//! Reconnect timing after a broker outage, measured on the paused clock.

use std::time::Duration;

use tokio::time::Instant;

use meshwatch_bridge::broker::MemoryBroker;
use meshwatch_bridge::{Bridge, BridgeSettings, ReconnectPolicy};
use meshwatch_link::testing::ScriptedLink;

fn settings(min_delay: Duration) -> BridgeSettings {
    BridgeSettings {
        policy: ReconnectPolicy {
            min_delay,
            max_delay: Duration::from_secs(60),
            ..ReconnectPolicy::default()
        },
        ..BridgeSettings::default()
    }
}

/// The broker goes away at `T` and comes back at `T + outage`. Returns the
/// connection attempts made after `T`, as offsets from `T`.
async fn outage(min_delay: Duration, outage: Duration) -> Vec<Duration> {
    meshwatch_bridge::logging::init_for_tests();
    let bridge = Bridge::new(
        settings(min_delay),
        ScriptedLink::new("radio"),
        MemoryBroker::new(),
    );
    bridge.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bridge.broker().connect_attempts().len(), 1);

    let t = Instant::now();
    bridge.broker().drop_connection();
    bridge.broker().set_reachable(false);

    tokio::time::sleep(outage).await;
    bridge.broker().set_reachable(true);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(bridge.broker_state().is_connected());

    let offsets = bridge
        .broker()
        .connect_attempts()
        .into_iter()
        .skip(1)
        .map(|at| at.duration_since(t))
        .collect();

    bridge.shutdown_handle().shutdown();
    bridge.run().await;
    bridge.shutdown().await;
    offsets
}

#[tokio::test(start_paused = true)]
async fn first_reconnect_waits_exactly_the_minimum_delay() {
    let attempts = outage(Duration::from_secs(2), Duration::from_secs(5)).await;
    assert_eq!(attempts[0], Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn delays_double_until_the_broker_returns() {
    // Attempts at +2 s (down), +6 s (up again after 5 s).
    let attempts = outage(Duration::from_secs(2), Duration::from_secs(5)).await;
    assert_eq!(
        attempts,
        vec![Duration::from_secs(2), Duration::from_secs(6)]
    );
}

#[tokio::test(start_paused = true)]
async fn sub_second_minimum_is_honoured() {
    let attempts = outage(Duration::from_millis(500), Duration::from_secs(5)).await;
    // +0.5, +1.5, +3.5, +7.5
    assert_eq!(
        attempts,
        vec![
            Duration::from_millis(500),
            Duration::from_millis(1500),
            Duration::from_millis(3500),
            Duration::from_millis(7500),
        ]
    );
}
