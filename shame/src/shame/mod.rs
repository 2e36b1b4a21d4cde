use regex::{self, Regex};
use std::collections::HashMap;
use std::env;
use std::net::Ipv4Addr;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use url::Url;

pub mod shm;
mod subscription;
mod udpm;

pub use self::subscription::Subscription;

use self::shm::Shm;
use self::udpm::Udpm;
use error::{HandleError, InitError, PublishError, SubscribeError};
use message::Message;
use utils::queue::ThreadSafeQueue;

/// Default Shame URL to be used when the `SHAME_DEFAULT_URL` environment
/// variable is not available.
const SHAME_DEFAULT_URL: &str = "udpm://239.255.67.76:6776?ttl=0&shm=Shame";

/// Default name of the shared memory segment when the URL does not name one.
const DEFAULT_SHM_NAME: &str = "Shame";

/// One inbound message on its way from the packer to the dispatcher:
/// `(channel, payload, len, shared_memory)`.
type InboundMessage = (String, Arc<Vec<u8>>, usize, bool);

/// Table of live subscriptions, keyed by the raw pattern string.
type SubscriptionTable = HashMap<String, Vec<Arc<Subscription>>>;

/// The bus: a UDPM transport, an optional shared memory registry, and a
/// dispatcher thread fanning inbound messages out to subscriptions.
pub struct Shame {
    udpm: Udpm,
    shm: Option<Arc<Shm>>,
    subscriptions: Arc<Mutex<SubscriptionTable>>,
    msg_queue: Arc<ThreadSafeQueue<InboundMessage>>,
    enable_thread_dispatch: Arc<AtomicBool>,
    handle_thread_dispatch: Option<thread::JoinHandle<()>>,
}

impl Shame {
    /// Creates a new `Shame` instance.
    ///
    /// This uses the `SHAME_DEFAULT_URL` environment variable to pick its
    /// settings. If the variable does not exist or is empty, it will use the
    /// default of "udpm://239.255.67.76:6776?ttl=0&shm=Shame".
    pub fn new() -> Result<Shame, InitError> {
        let shame_default_url = env::var("SHAME_DEFAULT_URL");
        let shame_url = match shame_default_url {
            Ok(ref s) if s.is_empty() => {
                debug!("SHAME_DEFAULT_URL available but empty. Using default settings.");
                SHAME_DEFAULT_URL
            }
            Ok(ref s) => {
                debug!("SHAME_DEFAULT_URL=\"{}\"", s);
                s
            }
            Err(_) => {
                debug!("SHAME_DEFAULT_URL not present or unavailable. Using default settings.");
                SHAME_DEFAULT_URL
            }
        };

        Shame::with_url(shame_url)
    }

    /// Creates a new `Shame` instance from a Shame URL of the form
    /// `udpm://ADDR:PORT?ttl=N&shm=NAME`.
    ///
    /// An empty `shm` value disables the shared memory side channel; an
    /// absent one selects the default segment name.
    pub fn with_url(shame_url: &str) -> Result<Shame, InitError> {
        debug!("Creating Shame instance using \"{}\"", shame_url);
        let url = Url::parse(shame_url).map_err(|_| InitError::InvalidShameUrl)?;

        if url.scheme() != "udpm" {
            return Err(InitError::UnknownTransport(url.scheme().into()));
        }

        let multicast_addr: Ipv4Addr = url.host_str()
            .ok_or(InitError::InvalidShameUrl)?
            .parse()
            .map_err(|_| InitError::InvalidShameUrl)?;
        let multicast_port = url.port().ok_or(InitError::InvalidShameUrl)?;

        let mut ttl = 0;
        let mut name_shm = DEFAULT_SHM_NAME.to_string();
        for (key, value) in url.query_pairs() {
            match &*key {
                "ttl" => ttl = value.parse().map_err(InitError::InvalidTtl)?,
                "shm" => name_shm = value.into_owned(),
                _ => {}
            }
        }

        Shame::with_settings(multicast_addr, multicast_port, ttl, &name_shm)
    }

    /// Creates a new `Shame` instance from explicit settings.
    ///
    /// An empty `name_shm` disables the shared memory side channel. The
    /// segment, when named, must already exist; it is created by the
    /// external `shame-server` utility.
    pub fn with_settings(
        multicast_addr: Ipv4Addr,
        multicast_port: u16,
        ttl: u32,
        name_shm: &str,
    ) -> Result<Shame, InitError> {
        let udpm = Udpm::new(multicast_addr, multicast_port, ttl)?;

        let shm = if name_shm.is_empty() {
            debug!("Shared memory disabled");
            None
        } else {
            Some(Arc::new(Shm::open(name_shm)?))
        };

        Ok(Shame {
            udpm,
            shm,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            msg_queue: Arc::new(ThreadSafeQueue::new()),
            enable_thread_dispatch: Arc::new(AtomicBool::new(false)),
            handle_thread_dispatch: None,
        })
    }

    /// Starts message handling: spawns the dispatcher and wires the receive
    /// path to it. Any previous session is stopped first.
    pub fn start_handling(&mut self) -> Result<(), HandleError> {
        self.stop_handling();
        self.msg_queue.clear();
        self.msg_queue.reset();
        self.enable_thread_dispatch.store(true, Ordering::Release);

        let queue = self.msg_queue.clone();
        let subscriptions = self.subscriptions.clone();
        let shm = self.shm.clone();
        let enable = self.enable_thread_dispatch.clone();
        let handle = thread::Builder::new()
            .name("shame-dispatch".into())
            .spawn(move || Shame::thread_dispatch(&queue, &subscriptions, &shm, &enable))?;
        self.handle_thread_dispatch = Some(handle);

        let queue = self.msg_queue.clone();
        self.udpm
            .start_async_receiving(move |channel, payload, size, shared_memory| {
                queue.enqueue((channel, payload, size, shared_memory));
            })?;

        Ok(())
    }

    /// Stops message handling. After this returns no further callbacks fire
    /// and all worker threads are joined.
    pub fn stop_handling(&mut self) {
        self.udpm.stop_async_receiving();

        self.enable_thread_dispatch.store(false, Ordering::Release);
        self.msg_queue.break_all_wait();
        if let Some(handle) = self.handle_thread_dispatch.take() {
            if handle.join().is_err() {
                error!("The dispatch thread panicked");
            }
        }
    }

    /// Publishes raw bytes on a channel.
    ///
    /// With `shared_memory` set, the payload is parked in the registry under
    /// the channel name and only the key travels over multicast. Returns the
    /// payload bytes published, or 0 on failure (which is logged).
    pub fn publish(&self, channel: &str, data: &[u8], shared_memory: bool) -> usize {
        match self.try_publish(channel, data, shared_memory) {
            Ok(size) => size,
            Err(e) => {
                warn!("Failed to publish on channel \"{}\": {}", channel, e);
                0
            }
        }
    }

    /// Publishes a structured message on a channel.
    ///
    /// The message is encoded first and then travels exactly like raw bytes.
    /// Returns the encoded bytes published, or 0 on failure.
    pub fn publish_msg<M>(&self, channel: &str, message: &M, shared_memory: bool) -> usize
    where
        M: Message,
    {
        let buffer = match message.encode_to_vec() {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(
                    "Failed to encode message for channel \"{}\": {}",
                    channel,
                    PublishError::MessageEncoding(e)
                );
                return 0;
            }
        };
        self.publish(channel, &buffer, shared_memory)
    }

    fn try_publish(
        &self,
        channel: &str,
        data: &[u8],
        shared_memory: bool,
    ) -> Result<usize, PublishError> {
        if !shared_memory {
            return self.udpm.send(channel, data, false);
        }

        let shm = self.shm.as_ref().ok_or(PublishError::ShmDisabled)?;

        // The registry entry is keyed by the channel name, so concurrent
        // publishers on one channel share one entry and the last writer
        // wins.
        let key = channel;
        let size_put = shm.put(key, data)?;
        self.udpm.send(channel, key.as_bytes(), true)?;
        Ok(size_put)
    }

    /// Subscribes to every channel the pattern fully matches.
    ///
    /// `callback_udpm` receives payloads that arrived inline; `callback_shm`
    /// receives registry entries and is expected to take the shared lock via
    /// [`ShameData::read`](shm::ShameData::read). Both callbacks run on the
    /// dispatcher thread and must not block it.
    pub fn subscribe<U, S>(
        &self,
        pattern: &str,
        callback_udpm: U,
        callback_shm: S,
    ) -> Result<Arc<Subscription>, SubscribeError>
    where
        U: Fn(&str, &Arc<Vec<u8>>, usize) + Send + Sync + 'static,
        S: Fn(&str, &shm::ShameData) + Send + Sync + 'static,
    {
        compile_pattern(pattern)?;
        Ok(self.register(Subscription::raw(pattern, callback_udpm, callback_shm)))
    }

    /// Subscribes with a typed callback; payloads are decoded into `M`
    /// before delivery, from the byte buffer or under the entry's shared
    /// lock as appropriate. The callback runs on the dispatcher thread and
    /// must not block it.
    pub fn subscribe_msg<M, F>(
        &self,
        pattern: &str,
        callback: F,
    ) -> Result<Arc<Subscription>, SubscribeError>
    where
        M: Message + 'static,
        F: Fn(&str, M, bool) + Send + Sync + 'static,
    {
        compile_pattern(pattern)?;
        Ok(self.register(Subscription::decoded::<M, F>(pattern, callback)))
    }

    fn register(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);
        let mut table = self.subscriptions.lock().unwrap();
        table
            .entry(subscription.pattern().to_string())
            .or_insert_with(Vec::new)
            .push(subscription.clone());
        subscription
    }

    /// Removes a subscription. Returns whether a removal occurred.
    pub fn unsubscribe(&self, subscription: &Arc<Subscription>) -> bool {
        let mut table = self.subscriptions.lock().unwrap();

        let mut removed = false;
        let mut now_empty = false;
        if let Some(subs) = table.get_mut(subscription.pattern()) {
            if let Some(position) = subs.iter().position(|s| Arc::ptr_eq(s, subscription)) {
                subs.remove(position);
                removed = true;
                now_empty = subs.is_empty();
            }
        }
        if now_empty {
            table.remove(subscription.pattern());
        }
        removed
    }

    /// The dispatcher: pops inbound messages and fans each one out to every
    /// subscription whose pattern fully matches its channel.
    fn thread_dispatch(
        queue: &ThreadSafeQueue<InboundMessage>,
        subscriptions: &Mutex<SubscriptionTable>,
        shm: &Option<Arc<Shm>>,
        enable: &AtomicBool,
    ) {
        // Compiled patterns, lazily built per dispatcher session. A pattern
        // that fails to compile is parked as `None` so it is only logged
        // once.
        let mut patterns: HashMap<String, Option<Regex>> = HashMap::new();

        while enable.load(Ordering::Acquire) {
            let (channel, payload, size, shared_memory) = match queue.wait_dequeue() {
                Some(message) => message,
                None => continue,
            };

            // Snapshot the table so subscribers may subscribe/unsubscribe
            // from inside their callbacks without deadlocking.
            let snapshot: Vec<(String, Vec<Arc<Subscription>>)> = {
                let table = subscriptions.lock().unwrap();
                table
                    .iter()
                    .map(|(pattern, subs)| (pattern.clone(), subs.clone()))
                    .collect()
            };

            for (pattern, subs) in snapshot {
                let regex = patterns.entry(pattern.clone()).or_insert_with(|| {
                    match compile_pattern(&pattern) {
                        Ok(regex) => Some(regex),
                        Err(e) => {
                            warn!("Skipping invalid channel pattern \"{}\": {}", pattern, e);
                            None
                        }
                    }
                });
                let regex = match *regex {
                    Some(ref regex) => regex,
                    None => continue,
                };

                trace!(
                    "Checking if channel \"{}\" matches pattern \"{}\"",
                    channel,
                    pattern
                );
                if !regex.is_match(&channel) {
                    continue;
                }

                if shared_memory {
                    let shm = match *shm {
                        Some(ref shm) => shm,
                        None => {
                            warn!(
                                "Received a shared memory key on channel \"{}\" but shared \
                                 memory is disabled",
                                channel
                            );
                            continue;
                        }
                    };
                    let key = match str::from_utf8(&payload[..size]) {
                        Ok(key) => key,
                        Err(_) => {
                            warn!("Malformed shared memory key on channel \"{}\"", channel);
                            continue;
                        }
                    };
                    let entry = match shm.find(key) {
                        Some(entry) => entry,
                        None => {
                            warn!("No shared memory entry for key \"{}\"", key);
                            continue;
                        }
                    };
                    for subscription in &subs {
                        subscription.deliver_shm(&channel, &entry);
                    }
                } else {
                    for subscription in &subs {
                        subscription.deliver_udpm(&channel, &payload, size);
                    }
                }
            }
        }
    }
}

impl Drop for Shame {
    fn drop(&mut self) {
        self.stop_handling();
    }
}

/// Compiles a channel pattern, anchored so that it must match the whole
/// channel name.
fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}
