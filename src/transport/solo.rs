//! Single-rank transport for serial runs.

use super::{Message, Transport};
use crate::channel::ChannelId;
use crate::rpc_error::RpcError;
use crate::topology::Rank;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

/// Rank 0 of a cluster of one. There is nobody to talk to, so `recv` only
/// returns once the transport is closed.
#[derive(Debug, Default)]
pub struct SoloTransport {
    closed: Mutex<bool>,
    wake: Condvar,
}

impl SoloTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for SoloTransport {
    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, dest: Rank, _channel: ChannelId, _payload: Bytes) -> Result<(), RpcError> {
        Err(RpcError::transport(dest, "a solo transport has no peers"))
    }

    fn recv(&self) -> Result<Option<Message>, RpcError> {
        let mut closed = self.closed.lock();
        while !*closed {
            self.wake.wait(&mut closed);
        }
        Ok(None)
    }

    fn flush(&self) -> Result<(), RpcError> {
        Ok(())
    }

    fn close(&self) {
        *self.closed.lock() = true;
        self.wake.notify_all();
    }
}
