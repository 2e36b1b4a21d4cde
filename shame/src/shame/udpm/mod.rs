//! The UDPM framing layer.
//!
//! Every datagram is `header ∥ channel ∥ 0x00 ∥ payload slice`. The header
//! is 20 bytes, little-endian, and its signature tells the receiver whether
//! the payload is the message itself or a key into the shared memory
//! registry. Messages that do not fit one datagram are split into packets
//! sharing a random id; the receiving side buffers them per id and delivers
//! the reassembled payload once every packet has arrived.

mod socket;

use byteorder::{ByteOrder, LittleEndian};
use rand;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use error::PublishError;
use utils::queue::ThreadSafeQueue;
use utils::time;

use self::socket::Socket;

/// Signature of a datagram that carries its payload inline.
pub const SIGNATURE_UDPM: u32 = 0x1965_1116;
/// Signature of a datagram whose payload is a shared memory key.
pub const SIGNATURE_SHM: u32 = 0x1969_1125;

pub const HEADER_SIZE: usize = 20;

/// The largest message the layer will send or reassemble.
pub const MAX_MESSAGE_SIZE: usize = 1 << 24;

/// Total payload bytes the reassembly table may hold before the oldest
/// incomplete message is evicted.
const MAX_PENDING_BYTES: usize = 64 << 20;

/// Incomplete messages older than this are purged.
const REASSEMBLY_TIMEOUT_US: u64 = 5_000_000;

/// The fixed wire header shared by every packet of a message.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Header {
    pub signature: u32,
    pub id: u32,
    pub len_payload: u32,
    pub num_packets: u32,
    pub offset: u32,
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.signature);
        LittleEndian::write_u32(&mut bytes[4..8], self.id);
        LittleEndian::write_u32(&mut bytes[8..12], self.len_payload);
        LittleEndian::write_u32(&mut bytes[12..16], self.num_packets);
        LittleEndian::write_u32(&mut bytes[16..20], self.offset);
        bytes
    }

    /// Reads a header from the front of `bytes`, which must hold at least
    /// `HEADER_SIZE` bytes.
    fn from_bytes(bytes: &[u8]) -> Header {
        Header {
            signature: LittleEndian::read_u32(&bytes[0..4]),
            id: LittleEndian::read_u32(&bytes[4..8]),
            len_payload: LittleEndian::read_u32(&bytes[8..12]),
            num_packets: LittleEndian::read_u32(&bytes[12..16]),
            offset: LittleEndian::read_u32(&bytes[16..20]),
        }
    }
}

/// Number of packets a payload of `len_payload` bytes occupies when each
/// packet carries at most `max_slice` payload bytes.
fn num_packets(len_payload: usize, max_slice: usize) -> usize {
    if len_payload == 0 {
        1
    } else {
        (len_payload + max_slice - 1) / max_slice
    }
}

/// The UDPM transport: framing and packetization on the way out, queued
/// reassembly on the way in.
pub struct Udpm {
    socket: Socket,
    msg_queue: Arc<ThreadSafeQueue<(Vec<u8>, usize)>>,
    enable_thread_pack: Arc<AtomicBool>,
    handle_thread_pack: Option<thread::JoinHandle<()>>,
}

impl Udpm {
    pub fn new(multicast_addr: Ipv4Addr, multicast_port: u16, ttl: u32) -> io::Result<Udpm> {
        debug!(
            "Starting UDPM transport (ip = {}, port = {}, ttl = {})",
            multicast_addr, multicast_port, ttl
        );
        Ok(Udpm {
            socket: Socket::new(multicast_addr, multicast_port, ttl)?,
            msg_queue: Arc::new(ThreadSafeQueue::new()),
            enable_thread_pack: Arc::new(AtomicBool::new(false)),
            handle_thread_pack: None,
        })
    }

    /// Sends `payload` on `channel`, splitting it into packets as needed.
    /// Returns the payload bytes transferred, exclusive of framing.
    pub fn send(
        &self,
        channel: &str,
        payload: &[u8],
        shared_memory: bool,
    ) -> Result<usize, PublishError> {
        if channel.is_empty() || channel.as_bytes().contains(&0) {
            return Err(PublishError::InvalidChannel);
        }
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(PublishError::MessageTooLarge {
                size: payload.len(),
            });
        }

        let max_len_packet = self.socket.max_len_packet();
        let overhead = HEADER_SIZE + channel.len() + 1;
        if overhead >= max_len_packet {
            return Err(PublishError::ChannelTooLong {
                channel: channel.len(),
                max_packet: max_len_packet,
            });
        }

        let mut header = Header {
            signature: if shared_memory {
                SIGNATURE_SHM
            } else {
                SIGNATURE_UDPM
            },
            id: rand::random(),
            len_payload: payload.len() as u32,
            num_packets: 1,
            offset: 0,
        };

        if overhead + payload.len() <= max_len_packet {
            trace!("Sending single packet message on channel \"{}\"", channel);
            self.send_packet(&header, channel, payload)?;
            return Ok(payload.len());
        }

        let max_slice = max_len_packet - overhead;
        header.num_packets = num_packets(payload.len(), max_slice) as u32;
        trace!(
            "Sending {} packets on channel \"{}\"",
            header.num_packets,
            channel
        );

        let mut sent = 0;
        for slice in payload.chunks(max_slice) {
            header.offset = sent as u32;
            self.send_packet(&header, channel, slice)?;
            sent += slice.len();
        }
        Ok(sent)
    }

    fn send_packet(
        &self,
        header: &Header,
        channel: &str,
        slice: &[u8],
    ) -> Result<(), PublishError> {
        let header_bytes = header.to_bytes();
        let expected = HEADER_SIZE + channel.len() + 1 + slice.len();
        let sent = self
            .socket
            .send_parts(&[&header_bytes, channel.as_bytes(), &[0u8], slice])?;
        if sent != expected {
            warn!(
                "The number of bytes sent ({}) did not equal the size of the datagram ({}).",
                sent, expected
            );
            return Err(PublishError::ShortSend { sent, expected });
        }
        Ok(())
    }

    /// Starts the receive path: the socket thread feeds raw datagrams into
    /// the inbound queue and the packer thread reassembles them, invoking
    /// `callback_recv` once per completed message with
    /// `(channel, payload, len, shared_memory)`.
    pub fn start_async_receiving<F>(&mut self, callback_recv: F) -> io::Result<()>
    where
        F: Fn(String, Arc<Vec<u8>>, usize, bool) + Send + 'static,
    {
        self.stop_async_receiving();
        self.msg_queue.clear();
        self.msg_queue.reset();
        self.enable_thread_pack.store(true, Ordering::Release);

        let queue = self.msg_queue.clone();
        let enable = self.enable_thread_pack.clone();
        debug!("Starting packer thread");
        let handle = thread::Builder::new()
            .name("shame-udpm-pack".into())
            .spawn(move || {
                let mut reassembler = Reassembler::new();
                while enable.load(Ordering::Acquire) {
                    let (buffer, size) = match queue.wait_dequeue() {
                        Some(packet) => packet,
                        None => continue,
                    };
                    if let Some((channel, payload, shared_memory)) =
                        reassembler.ingest(&buffer[..size])
                    {
                        let len = payload.len();
                        callback_recv(channel, Arc::new(payload), len, shared_memory);
                    }
                }
            })?;
        self.handle_thread_pack = Some(handle);

        let queue = self.msg_queue.clone();
        self.socket
            .start_async_receiving(move |buffer, size| queue.enqueue((buffer, size)))
    }

    /// Stops the receive path and drops all in-flight reassembly state.
    pub fn stop_async_receiving(&mut self) {
        self.socket.stop_async_receiving();

        self.enable_thread_pack.store(false, Ordering::Release);
        self.msg_queue.break_all_wait();
        if let Some(handle) = self.handle_thread_pack.take() {
            if handle.join().is_err() {
                error!("The packer thread panicked");
            }
        }
    }
}

impl Drop for Udpm {
    fn drop(&mut self) {
        self.stop_async_receiving();
    }
}

/// A partially reassembled message.
struct MessageBuffer {
    header: Header,
    channel: String,
    payload: Vec<u8>,
    received_offsets: HashSet<u32>,
    created_us: u64,
    // Insertion order; the wall clock alone cannot break ties between
    // messages started in the same microsecond.
    seq: u64,
}

/// Reassembles raw datagrams into complete messages.
///
/// Owned entirely by the packer thread, so nothing here needs a lock. The
/// table is bounded two ways: a total-bytes cap that evicts the oldest
/// incomplete message, and an age cap purged as new fragments arrive.
struct Reassembler {
    pending: HashMap<u32, MessageBuffer>,
    pending_bytes: usize,
    next_seq: u64,
}

impl Reassembler {
    fn new() -> Reassembler {
        Reassembler {
            pending: HashMap::new(),
            pending_bytes: 0,
            next_seq: 0,
        }
    }

    /// Consumes one datagram. Returns the completed message, if this
    /// datagram finished one, as `(channel, payload, shared_memory)`.
    fn ingest(&mut self, datagram: &[u8]) -> Option<(String, Vec<u8>, bool)> {
        if datagram.len() < HEADER_SIZE + 2 {
            debug!("Datagram too short to be a message. Dropping.");
            return None;
        }

        let header = Header::from_bytes(datagram);
        let shared_memory = match header.signature {
            SIGNATURE_UDPM => false,
            SIGNATURE_SHM => true,
            _ => {
                debug!("Invalid signature in datagram. Dropping.");
                return None;
            }
        };

        let rest = &datagram[HEADER_SIZE..];
        let channel_end = match rest.iter().position(|&b| b == 0) {
            Some(position) => position,
            None => {
                debug!("Unable to parse channel name in datagram. Dropping.");
                return None;
            }
        };
        let channel = match str::from_utf8(&rest[..channel_end]) {
            Ok(channel) if !channel.is_empty() => channel,
            _ => {
                debug!("Invalid channel name in datagram. Dropping.");
                return None;
            }
        };
        let slice = &rest[channel_end + 1..];

        let len_payload = header.len_payload as usize;
        if len_payload > MAX_MESSAGE_SIZE {
            debug!("Message too long. Dropping.");
            return None;
        }

        if header.num_packets == 1 {
            if header.offset != 0 || slice.len() != len_payload {
                debug!("Single packet message with inconsistent framing. Dropping.");
                return None;
            }
            let mut payload = vec![0u8; len_payload];
            payload.copy_from_slice(slice);
            return Some((channel.to_string(), payload, shared_memory));
        }

        if header.num_packets == 0 {
            debug!("Message claims zero packets. Dropping.");
            return None;
        }
        if header.offset as usize + slice.len() > len_payload {
            debug!("Fragment past the end of its message. Dropping.");
            return None;
        }

        self.purge_stale(time::now());

        // A fragment that disagrees with the pending message restarts it:
        // corruption and id collision look the same from here, and the new
        // header is the recoverable one.
        let restart = match self.pending.get(&header.id) {
            Some(entry) => {
                entry.header.num_packets != header.num_packets
                    || entry.header.len_payload != header.len_payload
            }
            None => false,
        };
        if restart {
            debug!(
                "Fragment disagrees with pending message {:#010x}. Restarting.",
                header.id
            );
            self.remove(header.id);
        }

        if !self.pending.contains_key(&header.id) {
            self.make_room(len_payload);
            self.pending_bytes += len_payload;
            let seq = self.next_seq;
            self.next_seq += 1;
            self.pending.insert(
                header.id,
                MessageBuffer {
                    header,
                    channel: channel.to_string(),
                    payload: vec![0u8; len_payload],
                    received_offsets: HashSet::new(),
                    created_us: time::now(),
                    seq,
                },
            );
        }

        let complete = match self.pending.get_mut(&header.id) {
            Some(entry) => {
                let offset = header.offset as usize;
                entry.payload[offset..offset + slice.len()].copy_from_slice(slice);
                // Duplicates overwrite the bytes but do not count twice.
                entry.received_offsets.insert(header.offset);
                entry.received_offsets.len() as u32 == entry.header.num_packets
            }
            None => false,
        };

        if complete {
            self.remove(header.id).map(|entry| {
                (
                    entry.channel,
                    entry.payload,
                    entry.header.signature == SIGNATURE_SHM,
                )
            })
        } else {
            None
        }
    }

    fn remove(&mut self, id: u32) -> Option<MessageBuffer> {
        let entry = self.pending.remove(&id);
        if let Some(ref entry) = entry {
            self.pending_bytes -= entry.payload.len();
        }
        entry
    }

    /// Evicts oldest-first until `incoming` more bytes fit the budget.
    fn make_room(&mut self, incoming: usize) {
        while !self.pending.is_empty() && self.pending_bytes + incoming > MAX_PENDING_BYTES {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|&(_, entry)| entry.seq)
                .map(|(&id, _)| id);
            if let Some(id) = oldest {
                debug!(
                    "Reassembly budget exceeded. Dropping incomplete message {:#010x}.",
                    id
                );
                self.remove(id);
            }
        }
    }

    fn purge_stale(&mut self, now_us: u64) {
        let stale: Vec<u32> = self
            .pending
            .iter()
            .filter(|&(_, entry)| now_us.saturating_sub(entry.created_us) > REASSEMBLY_TIMEOUT_US)
            .map(|(&id, _)| id)
            .collect();
        for id in stale {
            debug!("Dropping stale incomplete message {:#010x}.", id);
            self.remove(id);
        }
    }
}
