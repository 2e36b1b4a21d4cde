//! `shame-server NAME SIZE`
//!
//! Creates the named shared memory segment every bus instance on this host
//! opens, then parks until SIGINT and removes it again. The segment's
//! lifetime is exactly this process's lifetime; buses never create or
//! destroy it themselves.

extern crate env_logger;
extern crate libc;
#[macro_use]
extern crate log;
extern crate shame;

use shame::Shm;
use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Release);
}

fn main() {
    env_logger::init();

    let mut args = env::args();
    let program = args.next().unwrap_or_else(|| "shame-server".to_string());
    let (name, size) = match (args.next(), args.next()) {
        (Some(name), Some(size)) => (name, size),
        _ => {
            eprintln!("Usage: {} NAME SIZE", program);
            process::exit(2);
        }
    };
    let size: usize = match size.parse() {
        Ok(size) => size,
        Err(_) => {
            eprintln!("SIZE must be a size in bytes");
            process::exit(2);
        }
    };

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }

    // `create` replaces any leftover segment of the same name from a
    // previous, less graceful, run.
    let segment = match Shm::create(&name, size) {
        Ok(segment) => segment,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    println!(
        "Allocated {} bytes for shared memory segment: {}",
        size, name
    );

    while !INTERRUPTED.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(100));
    }

    println!("Exiting on signal SIGINT");
    drop(segment);
    Shm::unlink(&name);
    println!("Removed shared memory segment: {}", name);
    process::exit(1);
}
