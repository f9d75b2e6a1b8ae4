//! Concurrency tests for the resource store
//!
//! Readers and writers run on plain OS threads: the store is synchronous and
//! its locks block the calling thread.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;

use fleet_state::config::StoreConfig;
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::helpers::*;

#[test]
fn test_no_torn_reads_under_concurrent_updates() {
    let (store, _) = create_store(StoreConfig::default());
    store
        .update_machine("a", machine_info("host-0"), marked_snapshot(0))
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = vec![];
    for _ in 0..4 {
        let store = store.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let mut reads = 0;
            while !stop.load(Ordering::Relaxed) {
                let record = store.get_machine("a").unwrap().unwrap();
                let marker = record.metrics.memory_used;
                assert_eq!(record.metrics.swap_used, marker);
                assert_eq!(record.metrics.memory_total, marker);
                assert_eq!(record.metrics.cpu_avg, marker as f32);
                assert_eq!(record.info.hostname, Some(format!("host-{marker}")));
                reads += 1;
            }
            reads
        }));
    }

    let writers: Vec<_> = (0..4u64)
        .map(|w| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..250u64 {
                    let marker = w * 1000 + i;
                    store
                        .update_machine("a", machine_info(&format!("host-{marker}")), marked_snapshot(marker))
                        .unwrap();
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    assert_eq!(store.history_len("a").unwrap(), 1000);
}

#[test]
fn test_newer_write_wins_and_history_keeps_both_in_order() {
    let (store, _) = create_store(StoreConfig::default());
    let (m1_done_tx, m1_done_rx) = mpsc::channel();

    let m1 = {
        let store = store.clone();
        thread::spawn(move || {
            store
                .update_machine("A", machine_info("host-a"), marked_snapshot(1))
                .unwrap();
            m1_done_tx.send(()).unwrap();
        })
    };
    let m2 = {
        let store = store.clone();
        thread::spawn(move || {
            m1_done_rx.recv().unwrap();
            store
                .update_machine("A", machine_info("host-a"), marked_snapshot(2))
                .unwrap();
        })
    };
    m1.join().unwrap();
    m2.join().unwrap();

    let record = store.get_machine("A").unwrap().unwrap();
    assert_eq!(record.metrics.memory_used, 2);

    let history: Vec<_> = store
        .history("A", 10)
        .unwrap()
        .iter()
        .map(|entry| entry.snapshot.memory_used)
        .collect();
    assert_eq!(history, vec![1, 2]);
}

#[test]
fn test_history_stays_bounded_and_ordered_under_contention() {
    let (store, _) = create_store(StoreConfig {
        history_limit: 100,
        ..StoreConfig::default()
    });
    let barrier = Arc::new(Barrier::new(8));

    let writers: Vec<_> = (0..8u64)
        .map(|w| {
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..200u64 {
                    store
                        .update_machine("busy", machine_info("busy"), marked_snapshot(w * 1000 + i))
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let history = store.history("busy", usize::MAX).unwrap();
    assert_eq!(history.len(), 100);
    assert!(history.windows(2).all(|pair| pair[0].revision < pair[1].revision));

    // the registry holds the update with the highest revision, which is also the newest history entry
    let record = store.get_machine("busy").unwrap().unwrap();
    assert_eq!(record.revision, history[99].revision);
    assert_eq!(record.metrics, history[99].snapshot);
}

#[test]
fn test_remove_machine_under_load_never_deadlocks() {
    let (store, _) = create_store(StoreConfig {
        lock_timeout_ms: Some(5_000),
        ..StoreConfig::default()
    });

    let mut workers = vec![];
    for w in 0..4u64 {
        let store = store.clone();
        workers.push(thread::spawn(move || {
            for i in 0..200u64 {
                let id = format!("m{}", i % 5);
                store
                    .update_machine(&id, machine_info(&id), marked_snapshot(w * 1000 + i))
                    .unwrap();
                store.enqueue_command(&id, json!({ "op": "noop" })).unwrap();
                store.history(&id, 10).unwrap();
            }
        }));
    }
    for _ in 0..2 {
        let store = store.clone();
        workers.push(thread::spawn(move || {
            for i in 0..200 {
                store.remove_machine(&format!("m{}", i % 5)).unwrap();
                store.get_all_machines().unwrap();
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(store.machine_count().unwrap() <= 5);
}

#[test]
fn test_writer_makes_progress_against_busy_readers() {
    let (store, _) = create_store(StoreConfig {
        lock_timeout_ms: Some(5_000),
        ..StoreConfig::default()
    });
    for i in 0..50 {
        let id = format!("m{i}");
        store.update_machine(&id, machine_info(&id), marked_snapshot(i)).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    assert_eq!(store.get_all_machines().unwrap().len(), 50);
                }
            })
        })
        .collect();

    // every write must get through within the lock timeout despite the readers
    for i in 0..100 {
        store
            .update_machine("m0", machine_info("m0"), marked_snapshot(i))
            .unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_each_command_is_delivered_exactly_once() {
    let (store, _) = create_store(StoreConfig::default());

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let store = store.clone();
            thread::spawn(move || {
                (0..100)
                    .map(|i| {
                        store
                            .enqueue_command("target", json!({ "producer": p, "seq": i }))
                            .unwrap()
                            .id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                let mut delivered = vec![];
                for _ in 0..200 {
                    delivered.extend(
                        store
                            .dequeue_pending_commands("target")
                            .unwrap()
                            .into_iter()
                            .map(|command| command.id),
                    );
                    thread::yield_now();
                }
                delivered
            })
        })
        .collect();

    let enqueued: HashSet<_> = producers
        .into_iter()
        .flat_map(|producer| producer.join().unwrap())
        .collect();
    let mut delivered: Vec<_> = consumers
        .into_iter()
        .flat_map(|consumer| consumer.join().unwrap())
        .collect();
    delivered.extend(
        store
            .dequeue_pending_commands("target")
            .unwrap()
            .into_iter()
            .map(|command| command.id),
    );

    let unique: HashSet<_> = delivered.iter().copied().collect();
    assert_eq!(delivered.len(), 400);
    assert_eq!(unique, enqueued);
    assert_eq!(store.in_flight_commands("target").unwrap().len(), 400);
}
