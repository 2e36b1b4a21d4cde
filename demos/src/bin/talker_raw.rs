extern crate env_logger;
extern crate shame;

use shame::Shame;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let shame = Shame::new().expect("failed to construct the bus");

    let channel = "Shame";
    let data = vec![b'+'; 1024 * 1024]; // 1MB
    let shared_memory = true;
    let mut count = 0;

    loop {
        let size = shame.publish(channel, &data, shared_memory);

        count += 1;
        println!(
            "[{}] Published {} bytes on channel {} via {}",
            count,
            size,
            channel,
            if shared_memory { "shared memory" } else { "udpm" }
        );
        thread::sleep(Duration::from_millis(100));
    }
}
