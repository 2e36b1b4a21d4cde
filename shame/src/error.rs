//! Error types associated with bus operations.
//!
//! In general, one will want to return an `Error` from a function as all of
//! the other errors can be converted into the `Error` using either the `?`
//! operator or `From`. The other error types exist in case one wants to
//! attempt to recover from an error.

use regex;
use std::io;
use std::num;

/// A generic bus error.
///
/// If one does not intend to try and recover from errors, this is the best
/// error type to handle. All of the bus errors can be converted to this type
/// using the `?` operator.
#[derive(Debug, Fail)]
pub enum Error {
    /// An error happened while initializing the bus.
    #[fail(display = "An error happened during initialization.")]
    Init(#[cause] InitError),

    /// An error happened while trying to subscribe to a channel pattern.
    #[fail(display = "Failed to subscribe to the channel pattern.")]
    Subscribe(#[cause] SubscribeError),

    /// An error happened while trying to publish a message.
    #[fail(display = "Failed to publish message.")]
    Publish(#[cause] PublishError),

    /// An error happened while starting or stopping message handling.
    #[fail(display = "Unable to handle incoming messages.")]
    Handle(#[cause] HandleError),
}
impl From<InitError> for Error {
    fn from(err: InitError) -> Self {
        Error::Init(err)
    }
}
impl From<SubscribeError> for Error {
    fn from(err: SubscribeError) -> Self {
        Error::Subscribe(err)
    }
}
impl From<PublishError> for Error {
    fn from(err: PublishError) -> Self {
        Error::Publish(err)
    }
}
impl From<HandleError> for Error {
    fn from(err: HandleError) -> Self {
        Error::Handle(err)
    }
}

/// The bus was unable to start.
#[derive(Debug, Fail)]
pub enum InitError {
    /// There was an IO issue that prevented the transport from starting.
    ///
    /// The usual cause is a host without a multicast route. On Linux the
    /// loopback interface can be prepared with `ip link set lo multicast on`
    /// and `ip route add 224.0.0.0/4 dev lo`.
    #[fail(display = "The multicast transport failed to start due to an IO error.")]
    IoError(#[cause] io::Error),

    /// The supplied Shame URL requested a transport that isn't known.
    #[fail(display = "Unknown transport \"{}\".", _0)]
    UnknownTransport(String),

    /// The provided Shame URL was not valid.
    #[fail(display = "Invalid Shame URL.")]
    InvalidShameUrl,

    /// The TTL option could not be parsed.
    #[fail(display = "Invalid TTL value.")]
    InvalidTtl(#[cause] num::ParseIntError),

    /// The named shared memory segment could not be opened.
    ///
    /// The segment must exist before the bus starts; it is created by the
    /// external `shame-server` utility.
    #[fail(display = "Failed to open shared memory segment \"{}\".", name)]
    ShmOpen {
        /// The name of the segment.
        name: String,
        /// The underlying failure.
        #[cause]
        cause: io::Error,
    },
}

/// The attempt to subscribe to a channel pattern was unsuccessful.
#[derive(Debug, Fail)]
pub enum SubscribeError {
    /// The provided string was an invalid regular expression.
    #[fail(display = "Invalid regular expression used.")]
    InvalidRegex(#[cause] regex::Error),
}

/// Publishing to a channel failed.
#[derive(Debug, Fail)]
pub enum PublishError {
    /// There was an IO issue that prevented the transport from sending the
    /// message.
    #[fail(display = "Failed to send the message due to an IO error.")]
    IoError(#[cause] io::Error),

    /// The channel name was empty or contained a NUL byte.
    #[fail(display = "The channel name is not a valid channel.")]
    InvalidChannel,

    /// The channel name leaves no room for payload bytes in a datagram.
    #[fail(display = "Channel of {} bytes does not fit a {} byte datagram.", channel, max_packet)]
    ChannelTooLong {
        /// The length of the channel name in bytes.
        channel: usize,
        /// The maximum length of a single datagram.
        max_packet: usize,
    },

    /// The payload exceeds the largest message the bus will reassemble.
    #[fail(display = "Message of {} bytes exceeds the maximum message size.", size)]
    MessageTooLarge {
        /// The size of the rejected payload.
        size: usize,
    },

    /// The socket reported a partial datagram transfer.
    #[fail(display = "Sent {} of {} bytes.", sent, expected)]
    ShortSend {
        /// The number of bytes actually transferred.
        sent: usize,
        /// The size of the datagram.
        expected: usize,
    },

    /// There was an error while trying to encode the message.
    #[fail(display = "Unable to encode the message.")]
    MessageEncoding(#[cause] io::Error),

    /// A shared memory publish was requested on a bus constructed without
    /// shared memory support.
    #[fail(display = "This bus was not constructed with shared memory support.")]
    ShmDisabled,

    /// The shared memory registry rejected the payload.
    #[fail(display = "Failed to put the payload into shared memory.")]
    Shm(#[cause] ShmError),
}

/// A shared memory registry operation failed.
#[derive(Debug, Fail)]
pub enum ShmError {
    /// The key does not fit the fixed-size name field of a registry entry.
    #[fail(display = "Key of {} bytes exceeds the maximum key length.", len)]
    KeyTooLong {
        /// The length of the rejected key.
        len: usize,
    },

    /// Every slot of the registry table is in use.
    #[fail(display = "The shared memory registry table is full.")]
    TableFull,

    /// The segment allocator could not satisfy the request.
    #[fail(display = "The shared memory segment cannot fit {} more bytes.", requested)]
    SegmentFull {
        /// The number of bytes that could not be allocated.
        requested: usize,
    },
}

/// Starting or stopping message handling failed.
#[derive(Debug, Fail)]
pub enum HandleError {
    /// There was an IO error while wiring up the receive path.
    #[fail(display = "Failed to handle messages due to an IO error.")]
    IoError(#[cause] io::Error),
}

#[doc(hidden)]
pub mod from {
    use super::*;

    #[doc(hidden)]
    impl From<io::Error> for InitError {
        fn from(err: io::Error) -> Self {
            InitError::IoError(err)
        }
    }
    #[doc(hidden)]
    impl From<regex::Error> for SubscribeError {
        fn from(err: regex::Error) -> Self {
            SubscribeError::InvalidRegex(err)
        }
    }
    #[doc(hidden)]
    impl From<io::Error> for PublishError {
        fn from(err: io::Error) -> Self {
            PublishError::IoError(err)
        }
    }
    #[doc(hidden)]
    impl From<ShmError> for PublishError {
        fn from(err: ShmError) -> Self {
            PublishError::Shm(err)
        }
    }
    #[doc(hidden)]
    impl From<io::Error> for HandleError {
        fn from(err: io::Error) -> Self {
            HandleError::IoError(err)
        }
    }
}
