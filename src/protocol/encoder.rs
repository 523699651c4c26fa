//! PostgreSQL Frame Encoder
//!
//! Builds one outbound message at a time into a reusable buffer.
//! This is pure, synchronous computation - no I/O, no async.
//!
//! Wire format of every frame:
//! - tag (1 byte, omitted for startup-style messages)
//! - length (4 bytes, big-endian, includes self)
//! - payload

use bytes::{BufMut, Bytes, BytesMut};

const DEFAULT_CAPACITY: usize = 256;

/// Frame builder with an explicit length back-patch on `flush`.
///
/// ```
/// use pgwire_core::protocol::Encoder;
///
/// let mut enc = Encoder::new();
/// let frame = enc.init(Some(b'Q')).cstr("SELECT 1").flush();
/// assert_eq!(&frame[..5], &[b'Q', 0, 0, 0, 13]);
/// ```
#[derive(Debug)]
pub struct Encoder {
    buf: BytesMut,
    /// Offset of the length field of the message being built.
    header: Option<usize>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            header: None,
        }
    }

    /// Start a new message. `None` builds an untagged startup-style frame.
    pub fn init(&mut self, tag: Option<u8>) -> &mut Self {
        debug_assert!(
            self.header.is_none(),
            "Encoder::init called before the previous message was flushed"
        );
        self.buf.clear();
        self.ensure(5);
        if let Some(tag) = tag {
            self.buf.put_u8(tag);
        }
        self.header = Some(self.buf.len());
        self.buf.put_i32(0);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.ensure(4);
        self.buf.put_i32(v);
        self
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.ensure(2);
        self.buf.put_i16(v);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.ensure(1);
        self.buf.put_u8(v);
        self
    }

    /// UTF-8 bytes followed by a NUL terminator.
    pub fn cstr(&mut self, s: &str) -> &mut Self {
        self.ensure(s.len() + 1);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn bin(&mut self, data: &[u8]) -> &mut Self {
        self.ensure(data.len());
        self.buf.put_slice(data);
        self
    }

    /// Back-patch the length field and hand out the finished frame.
    ///
    /// The returned `Bytes` is exactly the frame; the encoder is ready for
    /// the next `init` and keeps its spare capacity.
    pub fn flush(&mut self) -> Bytes {
        let Some(header) = self.header.take() else {
            debug_assert!(false, "Encoder::flush called without init");
            return Bytes::new();
        };
        let len = (self.buf.len() - header) as i32;
        self.buf[header..header + 4].copy_from_slice(&len.to_be_bytes());
        self.buf.split().freeze()
    }

    /// True while a message is between `init` and `flush`.
    pub fn in_progress(&self) -> bool {
        self.header.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Grow by half the current capacity plus the shortfall.
    fn ensure(&mut self, additional: usize) {
        let len = self.buf.len();
        let cap = self.buf.capacity();
        if cap - len >= additional {
            return;
        }
        let shortfall = len + additional - cap;
        let target = cap + cap / 2 + shortfall;
        self.buf.reserve(target - len);
    }
}

/// Free list of encoders.
#[derive(Debug, Default)]
pub struct EncoderPool {
    free: Vec<Encoder>,
    max_idle: usize,
}

impl EncoderPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Vec::with_capacity(max_idle),
            max_idle,
        }
    }

    pub fn acquire(&mut self) -> Encoder {
        self.free.pop().unwrap_or_default()
    }

    /// Return an encoder. Releasing one mid-message is a programmer error.
    pub fn release(&mut self, encoder: Encoder) {
        debug_assert!(
            !encoder.in_progress(),
            "encoder released before flush"
        );
        if self.free.len() < self.max_idle {
            self.free.push(encoder);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}
