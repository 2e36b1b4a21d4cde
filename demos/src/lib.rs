//! Shared pieces of the demo programs.
//!
//! Run `shame-server Shame 16777216` first, then a talker and a listener in
//! separate terminals.

extern crate shame;

use shame::Message;
use std::io::{self, Read, Write};

/// The payload the message demos pass around: a publish timestamp and a
/// blob of content.
pub struct Raw {
    pub timestamp: u64,
    pub content: String,
}

impl Message for Raw {
    fn encode(&self, buffer: &mut dyn Write) -> io::Result<()> {
        self.timestamp.encode(buffer)?;
        self.content.encode(buffer)
    }

    fn decode(buffer: &mut dyn Read) -> io::Result<Raw> {
        Ok(Raw {
            timestamp: Message::decode(buffer)?,
            content: Message::decode(buffer)?,
        })
    }

    fn size(&self) -> usize {
        self.timestamp.size() + self.content.size()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_round_trips() {
        let raw = Raw {
            timestamp: 1234567890,
            content: "++++".to_string(),
        };
        let buffer = raw.encode_to_vec().unwrap();
        let decoded = Raw::decode_from_slice(&buffer).unwrap();
        assert_eq!(decoded.timestamp, raw.timestamp);
        assert_eq!(decoded.content, raw.content);
    }
}
