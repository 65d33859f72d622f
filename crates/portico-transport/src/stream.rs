//! Per-request virtual stream
//!
//! A `VirtualStream` is the byte-stream view one proxied public request
//! gets over the session's shared control channel. Writes emit one binary
//! frame each; reads pop frames from the channel's inbound FIFO in arrival
//! order. Closing the stream flips a local flag only: the underlying
//! channel is multiplexed across the whole session and must survive the
//! request.
//!
//! Both halves hold the session's request-serialization permit; it is
//! released when the last half is dropped, i.e. after both splice
//! directions have terminated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OwnedMutexGuard;

use crate::channel::{ChannelError, ControlChannel};

/// Read half of a virtual stream
#[derive(Debug)]
pub struct VirtualReader {
    channel: Arc<ControlChannel>,
    done: Arc<AtomicBool>,
    _permit: Arc<OwnedMutexGuard<()>>,
}

/// Write half of a virtual stream
#[derive(Debug)]
pub struct VirtualWriter {
    channel: Arc<ControlChannel>,
    done: Arc<AtomicBool>,
    _permit: Arc<OwnedMutexGuard<()>>,
}

/// Byte-stream view over the control channel for a single public request
#[derive(Debug)]
pub struct VirtualStream {
    reader: VirtualReader,
    writer: VirtualWriter,
}

impl VirtualStream {
    pub(crate) fn new(channel: Arc<ControlChannel>, permit: OwnedMutexGuard<()>) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let permit = Arc::new(permit);

        Self {
            reader: VirtualReader {
                channel: channel.clone(),
                done: done.clone(),
                _permit: permit.clone(),
            },
            writer: VirtualWriter {
                channel,
                done,
                _permit: permit,
            },
        }
    }

    /// Split into independently owned halves for bidirectional copying
    pub fn split(self) -> (VirtualReader, VirtualWriter) {
        (self.reader, self.writer)
    }

    /// Next data chunk; empty once the stream (or channel) has ended
    pub async fn recv(&mut self) -> Bytes {
        self.reader.recv().await
    }

    /// Send one chunk as exactly one binary frame
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.writer.send(data).await
    }

    /// Mark this request's stream done. Does NOT close the control channel.
    pub fn close(&mut self) {
        self.writer.close();
    }
}

impl VirtualReader {
    /// Next binary frame in arrival order; an empty chunk signals the end
    /// of this stream.
    pub async fn recv(&mut self) -> Bytes {
        if self.done.load(Ordering::SeqCst) {
            return Bytes::new();
        }

        match self.channel.recv_binary().await {
            Some(data) => data,
            None => {
                self.done.store(true, Ordering::SeqCst);
                Bytes::new()
            }
        }
    }

    /// Mark the stream done; the channel stays open
    pub fn close(&mut self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

impl VirtualWriter {
    /// Emit one binary frame carrying `data`
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if self.done.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.channel.send_binary(data).await
    }

    /// Mark the stream done; the channel stays open
    pub fn close(&mut self) {
        self.done.store(true, Ordering::SeqCst);
    }
}
