//! End-to-end round-trips over loopback multicast.
//!
//! Every test keeps TTL at 0 (datagrams never leave the host) and uses its
//! own multicast port so that parallel tests do not hear each other.

extern crate shame;

use shame::Shame;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

const GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 67, 76);

/// Give the freshly joined receive path a moment before publishing.
fn settle() {
    thread::sleep(Duration::from_millis(200));
}

#[test]
fn small_udpm_round_trip() {
    let mut bus = Shame::with_settings(GROUP, 21701, 0, "").unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    bus.subscribe(
        "^Shame$",
        move |channel: &str, data: &Arc<Vec<u8>>, size: usize| {
            let received = (channel.to_string(), data[..size].to_vec(), size);
            tx.lock().unwrap().send(received).unwrap();
        },
        |_channel, _entry| panic!("unexpected shared memory delivery"),
    )
    .unwrap();
    bus.start_handling().unwrap();
    settle();

    assert_eq!(bus.publish("Shame", b"hello", false), 5);

    let (channel, data, size) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(channel, "Shame");
    assert_eq!(size, 5);
    assert_eq!(data, b"hello");

    bus.stop_handling();
}

#[test]
fn large_payload_survives_fragmentation() {
    let mut bus = Shame::with_settings(GROUP, 21702, 0, "").unwrap();

    let payload: Vec<u8> = (0..1_048_576).map(|i| (i * 31 % 251) as u8).collect();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    bus.subscribe(
        "^Shame$",
        move |_channel: &str, data: &Arc<Vec<u8>>, size: usize| {
            tx.lock().unwrap().send(data[..size].to_vec()).unwrap();
        },
        |_channel, _entry| panic!("unexpected shared memory delivery"),
    )
    .unwrap();
    bus.start_handling().unwrap();
    settle();

    assert_eq!(bus.publish("Shame", &payload, false), payload.len());

    let received = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "payload arrived corrupted");

    bus.stop_handling();
}

#[test]
fn patterns_fan_out_to_matching_subscriptions() {
    let mut bus = Shame::with_settings(GROUP, 21703, 0, "").unwrap();

    let (tx, rx) = mpsc::channel();
    for &(tag, pattern) in [("A", "^foo$"), ("B", "^f.*$"), ("C", "^bar$")].iter() {
        let tx = Mutex::new(tx.clone());
        let tag = tag.to_string();
        bus.subscribe(
            pattern,
            move |_channel: &str, _data: &Arc<Vec<u8>>, _size: usize| {
                tx.lock().unwrap().send(tag.clone()).unwrap();
            },
            |_channel, _entry| panic!("unexpected shared memory delivery"),
        )
        .unwrap();
    }
    bus.start_handling().unwrap();
    settle();

    assert_eq!(bus.publish("foo", b"x", false), 1);

    let mut fired = vec![
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
    ];
    fired.sort();
    assert_eq!(fired, ["A", "B"]);

    // `^bar$` stays quiet.
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    bus.stop_handling();
}

#[test]
fn fan_out_order_follows_insertion_order() {
    let mut bus = Shame::with_settings(GROUP, 21704, 0, "").unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    for tag in 0..3usize {
        let order = order.clone();
        let done = if tag == 2 {
            Some(Mutex::new(tx.lock().unwrap().clone()))
        } else {
            None
        };
        bus.subscribe(
            "^order$",
            move |_channel: &str, _data: &Arc<Vec<u8>>, _size: usize| {
                order.lock().unwrap().push(tag);
                if let Some(ref done) = done {
                    done.lock().unwrap().send(()).unwrap();
                }
            },
            |_channel, _entry| panic!("unexpected shared memory delivery"),
        )
        .unwrap();
    }
    bus.start_handling().unwrap();
    settle();

    assert_eq!(bus.publish("order", b"x", false), 1);
    rx.recv_timeout(Duration::from_secs(10)).unwrap();

    assert_eq!(*order.lock().unwrap(), [0, 1, 2]);

    bus.stop_handling();
}

#[test]
fn unsubscribed_callbacks_stop_firing() {
    let mut bus = Shame::with_settings(GROUP, 21705, 0, "").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let counting = {
        let hits = hits.clone();
        bus.subscribe(
            "^gone$",
            move |_channel: &str, _data: &Arc<Vec<u8>>, _size: usize| {
                hits.fetch_add(1, Ordering::SeqCst);
            },
            |_channel, _entry| {},
        )
        .unwrap()
    };
    bus.subscribe(
        "^gone$",
        move |_channel: &str, _data: &Arc<Vec<u8>>, _size: usize| {
            tx.lock().unwrap().send(()).unwrap();
        },
        |_channel, _entry| {},
    )
    .unwrap();
    bus.start_handling().unwrap();
    settle();

    bus.publish("gone", b"x", false);
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(bus.unsubscribe(&counting));
    // A second unsubscribe finds nothing to remove.
    assert!(!bus.unsubscribe(&counting));

    bus.publish("gone", b"x", false);
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    bus.stop_handling();
}

#[test]
fn no_callbacks_after_stop_handling() {
    let mut bus = Shame::with_settings(GROUP, 21706, 0, "").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    {
        let hits = hits.clone();
        bus.subscribe(
            "^Shame$",
            move |_channel: &str, _data: &Arc<Vec<u8>>, _size: usize| {
                hits.fetch_add(1, Ordering::SeqCst);
                tx.lock().unwrap().send(()).unwrap();
            },
            |_channel, _entry| {},
        )
        .unwrap();
    }
    bus.start_handling().unwrap();
    settle();

    bus.publish("Shame", b"x", false);
    rx.recv_timeout(Duration::from_secs(10)).unwrap();

    bus.stop_handling();
    let seen = hits.load(Ordering::SeqCst);

    // Publishing still succeeds on the wire, but nothing is listening.
    assert_eq!(bus.publish("Shame", b"x", false), 1);
    thread::sleep(Duration::from_millis(500));
    assert_eq!(hits.load(Ordering::SeqCst), seen);
}

#[test]
fn shm_publish_without_shm_returns_zero() {
    let bus = Shame::with_settings(GROUP, 21707, 0, "").unwrap();
    let payload = vec![b'+'; 1024];
    assert_eq!(bus.publish("Shame", &payload, true), 0);
}

#[test]
fn handling_can_be_restarted() {
    let mut bus = Shame::with_settings(GROUP, 21708, 0, "").unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    bus.subscribe(
        "^Shame$",
        move |_channel: &str, data: &Arc<Vec<u8>>, size: usize| {
            tx.lock().unwrap().send(data[..size].to_vec()).unwrap();
        },
        |_channel, _entry| {},
    )
    .unwrap();

    bus.start_handling().unwrap();
    settle();
    bus.publish("Shame", b"first", false);
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), b"first");

    bus.stop_handling();
    bus.start_handling().unwrap();
    settle();
    bus.publish("Shame", b"second", false);
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), b"second");

    bus.stop_handling();
}
