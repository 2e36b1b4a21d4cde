extern crate env_logger;
extern crate shame;
extern crate shame_demos;

use shame::{now, Shame};
use shame_demos::Raw;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let mut shame = Shame::new().expect("failed to construct the bus");

    let count = Arc::new(AtomicUsize::new(0));
    shame
        .subscribe_msg::<Raw, _>("Shame", move |channel: &str, raw: Raw, shared_memory: bool| {
            let count = count.fetch_add(1, Ordering::Relaxed) + 1;
            println!(
                "[{}] Received message with {} bytes on channel {} via {} after {} us",
                count,
                raw.content.len(),
                channel,
                if shared_memory { "shared memory" } else { "udpm" },
                now() - raw.timestamp
            );
        })
        .expect("failed to subscribe");
    shame.start_handling().expect("failed to start handling");

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
