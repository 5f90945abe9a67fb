//! MPI backend (feature = "mpi-support").
//!
//! The channel id travels as the MPI tag and any-source probing stands in for
//! a blocking receive. All MPI calls go through one lock, so the library is
//! initialized with `Threading::Multiple` but never actually entered
//! concurrently, and no call made under the lock blocks on a peer.
//!
//! `send` only queues. `flush` posts every queued message as a nonblocking
//! send and returns; posted sends are completed from the receive loop, which
//! polls them alongside the probe. A rank therefore keeps receiving while its
//! own large sends wait for the peer to match them.

use super::{Message, Transport, check_dest};
use crate::channel::ChannelId;
use crate::rpc_error::RpcError;
use crate::topology::Rank;
use bytes::Bytes;
use mpi::Threading;
use mpi::environment::Universe;
use mpi::request::{Request, StaticScope};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long the receive loop sleeps when a probe finds nothing.
const IDLE_BACKOFF: Duration = Duration::from_micros(50);

/// Largest tag every MPI implementation accepts (`MPI_TAG_UB >= 32767`).
/// Channel ids above it cannot travel over this transport.
pub const MAX_CHANNEL_TAG: u16 = 32767;

/// A posted send and the buffer it reads from.
struct InFlight {
    request: Request<'static, [u8], StaticScope>,
    payload: Bytes,
}

pub struct MpiTransport {
    world: SimpleCommunicator,
    rank: Rank,
    size: usize,
    outbox: Mutex<Vec<(Rank, i32, Bytes)>>,
    /// Serializes every MPI call and owns the sends that are still in flight.
    mpi: Mutex<Vec<InFlight>>,
    closed: AtomicBool,
    // Dropping the universe finalizes MPI, so it goes last.
    _universe: Universe,
}

// SAFETY: MPI is initialized with at least `Threading::Serialized` and every
// call into it is serialized under `mpi`; the raw communicator handle and the
// in-flight requests are never exposed.
unsafe impl Send for MpiTransport {}
unsafe impl Sync for MpiTransport {}

/// MPI tag for `channel`.
fn channel_tag(dest: Rank, channel: ChannelId) -> Result<i32, RpcError> {
    if channel.as_u16() > MAX_CHANNEL_TAG {
        return Err(RpcError::transport(
            dest,
            format!("channel {channel} exceeds the MPI tag limit {MAX_CHANNEL_TAG}"),
        ));
    }
    Ok(i32::from(channel.as_u16()))
}

/// Drop every completed send, keep the rest.
fn reap(in_flight: &mut Vec<InFlight>) {
    *in_flight = std::mem::take(in_flight)
        .into_iter()
        .filter_map(|f| match f.request.test() {
            Ok(_) => None,
            Err(request) => Some(InFlight {
                request,
                payload: f.payload,
            }),
        })
        .collect();
}

impl MpiTransport {
    /// Initialize MPI and wrap `MPI_COMM_WORLD`.
    pub fn new() -> Result<Self, RpcError> {
        let (universe, threading) = mpi::initialize_with_threading(Threading::Multiple)
            .ok_or_else(|| RpcError::transport(None, "MPI is already initialized"))?;
        if threading < Threading::Serialized {
            return Err(RpcError::transport(
                None,
                format!("MPI provides only {threading:?} threading"),
            ));
        }
        let world = universe.world();
        let rank = world.rank() as Rank;
        let size = world.size() as usize;
        Ok(Self {
            world,
            rank,
            size,
            outbox: Mutex::new(Vec::new()),
            mpi: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            _universe: universe,
        })
    }
}

impl Transport for MpiTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: Rank, channel: ChannelId, payload: Bytes) -> Result<(), RpcError> {
        check_dest(dest, self.size)?;
        let tag = channel_tag(dest, channel)?;
        self.outbox.lock().push((dest, tag, payload));
        Ok(())
    }

    fn recv(&self) -> Result<Option<Message>, RpcError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            let received = {
                let mut in_flight = self.mpi.lock();
                reap(&mut in_flight);
                self.world
                    .any_process()
                    .immediate_matched_probe()
                    .map(|(msg, _)| msg.matched_receive_vec::<u8>())
            };
            match received {
                Some((data, status)) => {
                    let tag = u16::try_from(status.tag()).map_err(|_| {
                        RpcError::transport(
                            status.source_rank() as Rank,
                            format!("tag {} is not a channel id", status.tag()),
                        )
                    })?;
                    return Ok(Some(Message::new(
                        status.source_rank() as Rank,
                        ChannelId::new(tag),
                        data,
                    )));
                }
                None => std::thread::sleep(IDLE_BACKOFF),
            }
        }
    }

    fn flush(&self) -> Result<(), RpcError> {
        // Posting under the outbox lock keeps two flushing threads from
        // reordering this rank's sends.
        let mut outbox = self.outbox.lock();
        if outbox.is_empty() {
            return Ok(());
        }
        let mut in_flight = self.mpi.lock();
        for (dest, tag, payload) in outbox.drain(..) {
            // SAFETY: the `Bytes` that owns this memory is stored next to the
            // request and only dropped once the request has completed; `Bytes`
            // never moves its backing storage.
            let buf: &'static [u8] =
                unsafe { std::slice::from_raw_parts(payload.as_ptr(), payload.len()) };
            let request = self
                .world
                .process_at_rank(dest as i32)
                .immediate_send_with_tag(StaticScope, buf, tag);
            in_flight.push(InFlight {
                request,
                payload,
            });
        }
        reap(&mut in_flight);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Drop for MpiTransport {
    fn drop(&mut self) {
        // A request must complete before its buffer goes away.
        for f in self.mpi.get_mut().drain(..) {
            f.request.wait();
        }
    }
}
