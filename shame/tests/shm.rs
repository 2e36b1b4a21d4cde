//! End-to-end scenarios through the shared memory side channel.
//!
//! Each test plays bootstrap utility itself: it creates a scratch segment,
//! runs the scenario, and unlinks the segment on the way out.

extern crate shame;

use shame::{Shame, Shm};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

const GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 67, 76);

fn settle() {
    thread::sleep(Duration::from_millis(200));
}

fn scratch_name(tag: &str) -> String {
    format!("shame-e2e-{}-{}", tag, std::process::id())
}

#[test]
fn shm_round_trip() {
    let name = scratch_name("roundtrip");
    let _segment = Shm::create(&name, 4 * 1024 * 1024).unwrap();

    let mut bus = Shame::with_settings(GROUP, 21801, 0, &name).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    bus.subscribe(
        "^Shame$",
        |_channel: &str, _data: &Arc<Vec<u8>>, _size: usize| {
            panic!("payload should have travelled through shared memory");
        },
        move |channel: &str, entry: &shame::ShameData| {
            let bytes = entry.read();
            let all_plus = bytes.iter().all(|&b| b == b'+');
            tx.lock()
                .unwrap()
                .send((channel.to_string(), bytes.len(), all_plus))
                .unwrap();
        },
    )
    .unwrap();
    bus.start_handling().unwrap();
    settle();

    let payload = vec![b'+'; 1_048_576];
    assert_eq!(bus.publish("Shame", &payload, true), 1_048_576);

    let (channel, size, all_plus) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(channel, "Shame");
    assert_eq!(size, 1_048_576);
    assert!(all_plus);

    bus.stop_handling();
    drop(bus);
    Shm::unlink(&name);
}

#[test]
fn shm_signature_routes_to_the_shm_callback() {
    let name = scratch_name("signature");
    let segment = Shm::create(&name, 1024 * 1024).unwrap();
    segment.put("Shame", b"planted payload").unwrap();

    let mut bus = Shame::with_settings(GROUP, 21802, 0, &name).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    bus.subscribe(
        "^Shame$",
        |_channel: &str, _data: &Arc<Vec<u8>>, _size: usize| {
            panic!("the shm signature must not reach the udpm callback");
        },
        move |_channel: &str, entry: &shame::ShameData| {
            tx.lock().unwrap().send(entry.read().to_vec()).unwrap();
        },
    )
    .unwrap();
    bus.start_handling().unwrap();
    settle();

    // A hand-crafted datagram: shm signature, single packet, payload equal
    // to the key of the planted entry.
    let key = b"Shame";
    let mut datagram = Vec::new();
    datagram.extend_from_slice(&[0x25, 0x11, 0x69, 0x19]); // signature 0x19691125
    datagram.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]); // id
    datagram.extend_from_slice(&[0x05, 0x00, 0x00, 0x00]); // len_payload
    datagram.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]); // num_packets
    datagram.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // offset
    datagram.extend_from_slice(b"Shame\0");
    datagram.extend_from_slice(key);

    let sender = UdpSocket::bind("0.0.0.0:0").unwrap();
    sender.set_multicast_ttl_v4(0).unwrap();
    sender
        .send_to(&datagram, SocketAddr::new(GROUP.into(), 21802))
        .unwrap();

    let delivered = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(delivered, b"planted payload");

    bus.stop_handling();
    drop(bus);
    drop(segment);
    Shm::unlink(&name);
}

#[test]
fn unknown_key_drops_the_message() {
    let name = scratch_name("unknownkey");
    let _segment = Shm::create(&name, 1024 * 1024).unwrap();

    let mut bus = Shame::with_settings(GROUP, 21803, 0, &name).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    bus.subscribe(
        "^.*$",
        move |channel: &str, _data: &Arc<Vec<u8>>, _size: usize| {
            tx.lock().unwrap().send(channel.to_string()).unwrap();
        },
        |_channel: &str, _entry: &shame::ShameData| {
            panic!("no entry exists, so the shm callback must not fire");
        },
    )
    .unwrap();
    bus.start_handling().unwrap();
    settle();

    // The key is never put, so delivery is dropped with a log line...
    let mut datagram = Vec::new();
    datagram.extend_from_slice(&[0x25, 0x11, 0x69, 0x19]);
    datagram.extend_from_slice(&[0x02, 0x00, 0x00, 0x00]);
    datagram.extend_from_slice(&[0x07, 0x00, 0x00, 0x00]);
    datagram.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
    datagram.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    datagram.extend_from_slice(b"orphan\0");
    datagram.extend_from_slice(b"no-such");

    let sender = UdpSocket::bind("0.0.0.0:0").unwrap();
    sender.set_multicast_ttl_v4(0).unwrap();
    sender
        .send_to(&datagram, SocketAddr::new(GROUP.into(), 21803))
        .unwrap();

    // ...and the dispatcher keeps running: a normal publish still arrives.
    thread::sleep(Duration::from_millis(300));
    bus.publish("alive", b"x", false);
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), "alive");

    bus.stop_handling();
    drop(bus);
    Shm::unlink(&name);
}

#[test]
fn open_fails_without_a_server() {
    let err = Shame::with_settings(GROUP, 21804, 0, "shame-e2e-never-created");
    assert!(err.is_err());
}
