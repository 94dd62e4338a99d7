//! Stress Tests for the Stream Bridge
//!
//! Long-running scenarios: large streams consumed from many threads, repeated
//! to shake out ordering and termination races.
//!
//! # Running
//!
//! These tests are ignored by default:
//! ```bash
//! cargo test -p scoped-stream-core --test stress_tests -- --ignored --nocapture
//! ```

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scoped_stream_core::{
    BridgeConfig, InMemoryScopeProvider, ScopeOutcome, StreamBridge, StreamOptions,
};

const PERSONS: u32 = 10_000;
const REPEAT: usize = 20;

#[derive(Clone, Debug)]
struct Person {
    id: u32,
    name: String,
}

fn persons(bridge: &StreamBridge<InMemoryScopeProvider>, abort_after: Option<usize>) -> usize {
    let mut stream = bridge
        .stream(
            |scope| {
                let cache = scope.cache();
                Ok::<_, Infallible>((0..PERSONS).map(move |id| {
                    cache.track();
                    Ok(Person {
                        id,
                        name: format!("person-{id}"),
                    })
                }))
            },
            StreamOptions::readonly()
                .with_buffer_capacity(1000)
                .with_clear_resource_every(1000),
        )
        .unwrap();

    let mut seen = 0usize;
    while let Some(person) = stream.next() {
        let person = person.unwrap();
        assert_eq!(person.id as usize, seen);
        assert!(person.name.starts_with("person-"));
        seen += 1;
        if abort_after == Some(seen) {
            break;
        }
    }
    seen
}

#[test]
#[ignore = "long-running"]
fn stress_repeated_full_streams() {
    let provider = InMemoryScopeProvider::with_max_open(4);
    let bridge = StreamBridge::new(provider.clone(), BridgeConfig::default()).unwrap();
    let start = Instant::now();

    for round in 0..REPEAT {
        assert_eq!(persons(&bridge, None), PERSONS as usize, "round {round}");
    }

    assert!(provider.wait_for_terminations(REPEAT, Duration::from_secs(30)));
    let records = provider.records();
    assert!(records
        .iter()
        .all(|r| r.outcome == Some(ScopeOutcome::Committed) && r.flushes == 10));
    assert!(records.iter().all(|r| r.peak_cache <= 1000));
    println!("{REPEAT} x {PERSONS} persons in {:?}", start.elapsed());
}

#[test]
#[ignore = "long-running"]
fn stress_many_consumers_mixed_aborts() {
    let provider = InMemoryScopeProvider::with_max_open(3);
    let bridge = StreamBridge::new(provider.clone(), BridgeConfig::default()).unwrap();
    let aborted = Arc::new(AtomicUsize::new(0));

    let consumers: Vec<_> = (0..12)
        .map(|i| {
            let bridge = bridge.clone();
            let aborted = Arc::clone(&aborted);
            std::thread::spawn(move || {
                for round in 0..REPEAT {
                    if (i + round) % 3 == 0 {
                        let limit = 10 + round * 7;
                        assert_eq!(persons(&bridge, Some(limit)), limit);
                        aborted.fetch_add(1, Ordering::SeqCst);
                    } else {
                        assert_eq!(persons(&bridge, None), PERSONS as usize);
                    }
                }
            })
        })
        .collect();

    for consumer in consumers {
        consumer.join().unwrap();
    }

    let total = 12 * REPEAT;
    assert!(provider.wait_for_terminations(total, Duration::from_secs(60)));
    assert!(provider.peak_open_scopes() <= 3);

    let rolled_back = provider
        .records()
        .iter()
        .filter(|r| r.outcome == Some(ScopeOutcome::RolledBack))
        .count();
    assert_eq!(rolled_back, aborted.load(Ordering::SeqCst));
}
