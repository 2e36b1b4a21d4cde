use std::sync::Arc;

use message::Message;

use super::shm::ShameData;

/// A subscription to a channel pattern.
///
/// Each subscription carries two delivery paths: one for payloads that
/// arrived inline over UDPM and one for payloads parked in shared memory.
/// Raw subscriptions expose both paths to the user directly; message
/// subscriptions wrap a single typed callback in decoding shims for each
/// path.
///
/// The handle returned by `subscribe` is shared with the dispatch table, so
/// a subscription stays deliverable until `unsubscribe` removes it, and any
/// delivery already in flight completes even then.
pub struct Subscription {
    pattern: String,
    callback_udpm: Box<dyn Fn(&str, &Arc<Vec<u8>>, usize) + Send + Sync>,
    callback_shm: Box<dyn Fn(&str, &ShameData) + Send + Sync>,
}

impl Subscription {
    /// Builds a subscription delivering raw bytes and registry entries.
    pub(crate) fn raw<U, S>(pattern: &str, callback_udpm: U, callback_shm: S) -> Subscription
    where
        U: Fn(&str, &Arc<Vec<u8>>, usize) + Send + Sync + 'static,
        S: Fn(&str, &ShameData) + Send + Sync + 'static,
    {
        Subscription {
            pattern: pattern.to_string(),
            callback_udpm: Box::new(callback_udpm),
            callback_shm: Box::new(callback_shm),
        }
    }

    /// Builds a subscription that decodes payloads into `M` before invoking
    /// the callback with `(channel, message, came_via_shared_memory)`.
    ///
    /// A payload that fails to decode is logged and dropped.
    pub(crate) fn decoded<M, F>(pattern: &str, callback: F) -> Subscription
    where
        M: Message + 'static,
        F: Fn(&str, M, bool) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);

        let callback_udpm = {
            let callback = callback.clone();
            move |channel: &str, data: &Arc<Vec<u8>>, size: usize| {
                match M::decode_from_slice(&data[..size]) {
                    Ok(message) => callback(channel, message, false),
                    Err(e) => warn!("Error decoding message on channel \"{}\": {}", channel, e),
                }
            }
        };

        let callback_shm = move |channel: &str, entry: &ShameData| {
            // Decode under the shared lock, run the callback after releasing
            // it so slow subscribers do not starve the writer.
            let decoded = {
                let bytes = entry.read();
                M::decode_from_slice(&bytes)
            };
            match decoded {
                Ok(message) => callback(channel, message, true),
                Err(e) => warn!("Error decoding message on channel \"{}\": {}", channel, e),
            }
        };

        Subscription {
            pattern: pattern.to_string(),
            callback_udpm: Box::new(callback_udpm),
            callback_shm: Box::new(callback_shm),
        }
    }

    /// The pattern this subscription was registered under, as supplied to
    /// `subscribe`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub(crate) fn deliver_udpm(&self, channel: &str, data: &Arc<Vec<u8>>, size: usize) {
        (self.callback_udpm)(channel, data, size);
    }

    pub(crate) fn deliver_shm(&self, channel: &str, entry: &ShameData) {
        (self.callback_shm)(channel, entry);
    }
}
