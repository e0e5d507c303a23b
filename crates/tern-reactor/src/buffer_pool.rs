//! Send buffers.
//!
//! The pool recycles byte vectors between sends and enforces each channel's
//! `guaranteed_output_buffers` limit on buffers handed to the application.
//! Messages the reactor encodes itself go through [`BufferPool::encode`],
//! which regrows the buffer when the first attempt at the channel's fragment
//! size is too small.

use crate::error::{ReactorError, Result};
use crate::session::ChannelId;
use std::collections::HashMap;
use tern_codec::{Codec, CodecError, Msg, ProtocolVersion};

/// Send buffer obtained from `Reactor::get_buffer`
#[derive(Debug)]
pub struct Buffer {
    channel: ChannelId,
    data: Vec<u8>,
    len: usize,
    large: bool,
}

impl Buffer {
    /// Channel the buffer belongs to
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Bytes that will be sent
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing will be sent
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size requested from `get_buffer`
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer may exceed the channel's fragment size
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.large
    }

    /// Bytes that will be sent
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole buffer, for writing
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set how many bytes will be sent
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.data.len() {
            return Err(ReactorError::invalid(format!(
                "length {len} exceeds buffer capacity {}",
                self.data.len()
            )));
        }
        self.len = len;
        Ok(())
    }

    /// Encode `msg` into the buffer and set its length.
    ///
    /// # Errors
    ///
    /// Returns the codec's error, including `BufferTooSmall`; the buffer is
    /// unchanged in that case.
    pub fn encode(
        &mut self,
        codec: &dyn Codec,
        msg: &Msg,
        version: ProtocolVersion,
    ) -> std::result::Result<usize, CodecError> {
        let n = codec.encode(msg, version, &mut self.data)?;
        self.len = n;
        Ok(n)
    }

    pub(crate) fn into_parts(self) -> (ChannelId, Vec<u8>, usize) {
        (self.channel, self.data, self.len)
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Recycled send buffers with per-channel accounting
#[derive(Debug)]
pub(crate) struct BufferPool {
    free: Vec<Vec<u8>>,
    capacity: usize,
    outstanding: HashMap<ChannelId, usize>,
}

impl BufferPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
            outstanding: HashMap::new(),
        }
    }

    fn take(&mut self, size: usize) -> Vec<u8> {
        let mut data = self.free.pop().unwrap_or_default();
        data.clear();
        data.resize(size, 0);
        data
    }

    pub(crate) fn recycle(&mut self, data: Vec<u8>) {
        if self.free.len() < self.capacity {
            self.free.push(data);
        }
    }

    /// Hand a buffer to the application, enforcing `limit` per channel
    pub(crate) fn acquire(
        &mut self,
        channel: ChannelId,
        size: usize,
        large: bool,
        limit: usize,
    ) -> Result<Buffer> {
        let held = self.outstanding.entry(channel).or_insert(0);
        if *held >= limit {
            return Err(ReactorError::NoBuffers(channel));
        }
        *held += 1;

        Ok(Buffer {
            channel,
            data: self.take(size),
            len: size,
            large,
        })
    }

    /// Return an application buffer's storage
    pub(crate) fn release(&mut self, channel: ChannelId, data: Vec<u8>) {
        if let Some(held) = self.outstanding.get_mut(&channel) {
            *held = held.saturating_sub(1);
        }
        self.recycle(data);
    }

    pub(crate) fn outstanding(&self, channel: ChannelId) -> usize {
        self.outstanding.get(&channel).copied().unwrap_or(0)
    }

    pub(crate) fn forget(&mut self, channel: ChannelId) {
        self.outstanding.remove(&channel);
    }

    /// Encode `msg`, starting at `initial` bytes and regrowing once to the
    /// size the codec reports. The returned vector holds exactly the encoded
    /// bytes and should be handed back through [`BufferPool::recycle`].
    pub(crate) fn encode(
        &mut self,
        codec: &dyn Codec,
        msg: &Msg,
        version: ProtocolVersion,
        initial: usize,
    ) -> std::result::Result<Vec<u8>, CodecError> {
        let mut data = self.take(initial);
        let n = match codec.encode(msg, version, &mut data) {
            Ok(n) => n,
            Err(CodecError::BufferTooSmall { needed, available }) => {
                tracing::debug!(
                    "Growing {:?} {:?} buffer from {} to {} bytes",
                    msg.domain,
                    msg.class,
                    available,
                    needed
                );
                data.resize(needed, 0);
                match codec.encode(msg, version, &mut data) {
                    Ok(n) => n,
                    Err(e) => {
                        self.recycle(data);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.recycle(data);
                return Err(e);
            }
        };
        data.truncate(n);
        Ok(data)
    }
}
