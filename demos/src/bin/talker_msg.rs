extern crate env_logger;
extern crate shame;
extern crate shame_demos;

use shame::{now, Shame};
use shame_demos::Raw;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let shame = Shame::new().expect("failed to construct the bus");

    let channel = "Shame";
    let shared_memory = true;
    let mut count = 0;

    let mut raw = Raw {
        timestamp: 0,
        content: ::std::iter::repeat('+').take(1024 * 1024).collect(),
    };

    loop {
        raw.timestamp = now();
        shame.publish_msg(channel, &raw, shared_memory);

        count += 1;
        println!(
            "[{}] Published message with {} bytes on channel {} via {}",
            count,
            raw.content.len(),
            channel,
            if shared_memory { "shared memory" } else { "udpm" }
        );
        thread::sleep(Duration::from_millis(100));
    }
}
