use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// A structured message that can travel over the bus.
///
/// This is the interface the bus consumes from the serialization layer;
/// `Shame::publish_msg` and `Shame::subscribe_msg` are generic over it.
/// Everything is encoded little-endian, matching the wire header.
pub trait Message: Sized {
    /// Encodes the message into a buffer.
    fn encode(&self, buffer: &mut dyn Write) -> io::Result<()>;

    /// Decodes a message from a buffer.
    fn decode(buffer: &mut dyn Read) -> io::Result<Self>;

    /// Returns the number of bytes the message is expected to take when
    /// encoded.
    fn size(&self) -> usize;

    /// Encodes the message into a freshly allocated buffer.
    fn encode_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.size());
        self.encode(&mut buffer)?;
        Ok(buffer)
    }

    /// Decodes a message from a byte slice.
    fn decode_from_slice(buffer: &[u8]) -> io::Result<Self> {
        let mut buffer = buffer;
        Self::decode(&mut buffer)
    }
}

macro_rules! impl_message {
    ( $type:ty, $read:ident, $write:ident $(, $endian:ident )* ) => {
        impl Message for $type {
            fn encode(&self, buffer: &mut dyn Write) -> io::Result<()> {
                buffer.$write::<$($endian),*>(*self)
            }

            fn decode(buffer: &mut dyn Read) -> io::Result<Self> {
                buffer.$read::<$($endian),*>()
            }

            fn size(&self) -> usize {
                ::std::mem::size_of::<$type>()
            }
        }
    };
}

impl_message!(u8, read_u8, write_u8);
impl_message!(u16, read_u16, write_u16, LittleEndian);
impl_message!(u32, read_u32, write_u32, LittleEndian);
impl_message!(u64, read_u64, write_u64, LittleEndian);

impl_message!(i8, read_i8, write_i8);
impl_message!(i16, read_i16, write_i16, LittleEndian);
impl_message!(i32, read_i32, write_i32, LittleEndian);
impl_message!(i64, read_i64, write_i64, LittleEndian);

impl_message!(f32, read_f32, write_f32, LittleEndian);
impl_message!(f64, read_f64, write_f64, LittleEndian);

impl Message for bool {
    fn encode(&self, buffer: &mut dyn Write) -> io::Result<()> {
        let value: u8 = if *self { 1 } else { 0 };
        value.encode(buffer)
    }

    fn decode(buffer: &mut dyn Read) -> io::Result<Self> {
        match u8::decode(buffer)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Booleans should be encoded as 0 or 1",
            )),
        }
    }

    fn size(&self) -> usize {
        ::std::mem::size_of::<u8>()
    }
}

/// Reads a length-prefixed run of bytes.
///
/// The allocation is bounded by the bytes actually present in the buffer, so
/// a corrupt length prefix cannot cause an oversized allocation.
fn decode_bytes(buffer: &mut dyn Read, len: usize) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    buffer.take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Buffer ended before the declared length",
        ));
    }
    Ok(bytes)
}

impl Message for Vec<u8> {
    fn encode(&self, buffer: &mut dyn Write) -> io::Result<()> {
        (self.len() as u32).encode(buffer)?;
        buffer.write_all(self)
    }

    fn decode(buffer: &mut dyn Read) -> io::Result<Self> {
        let len = u32::decode(buffer)? as usize;
        decode_bytes(buffer, len)
    }

    fn size(&self) -> usize {
        ::std::mem::size_of::<u32>() + self.len()
    }
}

impl Message for String {
    fn encode(&self, buffer: &mut dyn Write) -> io::Result<()> {
        (self.len() as u32).encode(buffer)?;
        buffer.write_all(self.as_bytes())
    }

    fn decode(buffer: &mut dyn Read) -> io::Result<Self> {
        let len = u32::decode(buffer)? as usize;
        let bytes = decode_bytes(buffer, len)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn size(&self) -> usize {
        ::std::mem::size_of::<u32>() + self.len()
    }
}
