extern crate env_logger;
extern crate shame;

use shame::{Shame, ShameData};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let mut shame = Shame::new().expect("failed to construct the bus");

    let count_udpm = Arc::new(AtomicUsize::new(0));
    let count_shm = Arc::new(AtomicUsize::new(0));
    shame
        .subscribe(
            "Shame",
            move |channel: &str, _data: &Arc<Vec<u8>>, size: usize| {
                let count = count_udpm.fetch_add(1, Ordering::Relaxed) + 1;
                println!(
                    "[{}] Received {} bytes on channel {} via udpm",
                    count, size, channel
                );
            },
            move |channel: &str, entry: &ShameData| {
                let data = entry.read();
                let count = count_shm.fetch_add(1, Ordering::Relaxed) + 1;
                println!(
                    "[{}] Received {} bytes on channel {} via shared memory",
                    count,
                    data.len(),
                    channel
                );
            },
        )
        .expect("failed to subscribe");
    shame.start_handling().expect("failed to start handling");

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
