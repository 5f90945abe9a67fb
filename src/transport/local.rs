//! Intra-process transport: every rank is a thread of the same process.
//!
//! Each rank owns an inbox. `send` only appends to the sender's outbox;
//! `flush` moves the outbox into the destination inboxes in order, which is
//! what gives per-sender FIFO delivery.

use super::{Message, Transport, check_dest};
use crate::channel::ChannelId;
use crate::rpc_error::RpcError;
use crate::topology::Rank;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

/// One committed message, as recorded by a traced cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub from: Rank,
    pub to: Rank,
    pub channel: ChannelId,
    pub len: usize,
}

#[derive(Default)]
struct InboxState {
    queue: VecDeque<Message>,
    closed: bool,
}

#[derive(Default)]
struct Inbox {
    state: Mutex<InboxState>,
    ready: Condvar,
}

impl Inbox {
    fn push(&self, msg: Message) {
        let mut st = self.state.lock();
        st.queue.push_back(msg);
        self.ready.notify_one();
    }
}

type Trace = Arc<Mutex<Vec<Envelope>>>;

/// Factory and shared state for a set of [`LocalTransport`]s.
pub struct LocalCluster {
    inboxes: Arc<[Inbox]>,
    trace: Option<Trace>,
}

impl LocalCluster {
    /// A cluster of `size` ranks. Take the per-rank transports with
    /// [`transports`](Self::transports).
    pub fn new(size: usize) -> Self {
        Self {
            inboxes: (0..size).map(|_| Inbox::default()).collect(),
            trace: None,
        }
    }

    /// Like [`new`](Self::new), but records every committed message.
    pub fn with_trace(size: usize) -> Self {
        Self {
            trace: Some(Arc::new(Mutex::new(Vec::new()))),
            ..Self::new(size)
        }
    }

    pub fn size(&self) -> usize {
        self.inboxes.len()
    }

    /// Transport for `rank`.
    pub fn transport(&self, rank: Rank) -> Result<LocalTransport, RpcError> {
        check_dest(rank, self.size())?;
        Ok(LocalTransport {
            rank,
            inboxes: Arc::clone(&self.inboxes),
            outbox: Mutex::new(Vec::new()),
            trace: self.trace.clone(),
        })
    }

    /// One transport per rank, indexed by rank.
    pub fn transports(&self) -> Vec<LocalTransport> {
        (0..self.size())
            .map(|rank| LocalTransport {
                rank,
                inboxes: Arc::clone(&self.inboxes),
                outbox: Mutex::new(Vec::new()),
                trace: self.trace.clone(),
            })
            .collect()
    }

    /// Messages committed so far, in commit order. Empty for untraced clusters.
    pub fn trace(&self) -> Vec<Envelope> {
        self.trace
            .as_ref()
            .map(|t| t.lock().clone())
            .unwrap_or_default()
    }
}

/// One rank's view of a [`LocalCluster`].
pub struct LocalTransport {
    rank: Rank,
    inboxes: Arc<[Inbox]>,
    outbox: Mutex<Vec<(Rank, Message)>>,
    trace: Option<Trace>,
}

impl LocalTransport {
    /// Number of sends queued but not yet flushed.
    pub fn pending(&self) -> usize {
        self.outbox.lock().len()
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.inboxes.len()
    }

    fn send(&self, dest: Rank, channel: ChannelId, payload: Bytes) -> Result<(), RpcError> {
        check_dest(dest, self.size())?;
        self.outbox
            .lock()
            .push((dest, Message::new(self.rank, channel, payload)));
        Ok(())
    }

    fn recv(&self) -> Result<Option<Message>, RpcError> {
        let inbox = &self.inboxes[self.rank];
        let mut st = inbox.state.lock();
        loop {
            if st.closed {
                return Ok(None);
            }
            if let Some(msg) = st.queue.pop_front() {
                return Ok(Some(msg));
            }
            inbox.ready.wait(&mut st);
        }
    }

    fn flush(&self) -> Result<(), RpcError> {
        // Hold the outbox for the whole commit so two flushing threads cannot
        // interleave and reorder this sender's messages.
        let mut outbox = self.outbox.lock();
        for (dest, msg) in outbox.drain(..) {
            // Record before delivery: the receiver may react (and commit its
            // own traffic) as soon as the message is in its inbox.
            if let Some(trace) = &self.trace {
                trace.lock().push(Envelope {
                    from: msg.sender,
                    to: dest,
                    channel: msg.channel,
                    len: msg.payload.len(),
                });
            }
            self.inboxes[dest].push(msg);
        }
        Ok(())
    }

    fn close(&self) {
        let inbox = &self.inboxes[self.rank];
        inbox.state.lock().closed = true;
        inbox.ready.notify_all();
    }
}
