//! Shame is a lightweight publish/subscribe message bus for processes that
//! share a host or a LAN segment. Publishers name a channel and send either
//! raw bytes or a structured message; subscribers register channel patterns
//! (regular expressions) and receive every message whose channel the pattern
//! fully matches.
//!
//! Two transports cooperate. UDP multicast carries all control notifications
//! and small payloads, fragmenting anything larger than a single datagram. A
//! named shared memory segment acts as a zero-copy side channel for large
//! payloads: in shared memory mode the datagram only carries a key into the
//! segment, and subscribers resolve the key and read the payload in place
//! under a shared lock.
//!
//! The segment itself is created and destroyed by the external `shame-server`
//! utility; a [`Shame`] instance only ever opens it.

#[macro_use]
extern crate log;
#[macro_use]
extern crate failure;

extern crate byteorder;
extern crate libc;
extern crate net2;
extern crate rand;
extern crate regex;
extern crate url;

mod utils;
pub use utils::time::now;

pub mod error;

mod message;
pub use message::Message;

mod shame;
pub use shame::shm::{ShameData, Shm, ShmReadGuard};
pub use shame::{Shame, Subscription};
