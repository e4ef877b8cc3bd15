//! A group of requests whose responses are awaited together.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use flume::{Receiver, Selector, Sender};

use crate::common::{PeerAddress, RequestSpecific};
use crate::shutdown::Shutdown;

use super::socket::{Reply, RpcSocket};

#[derive(Debug)]
pub(crate) enum Event {
    Reply(Reply),
    /// The deadline passed without a reply.
    Timeout,
    Shutdown,
}

/// Requests sent through one [RpcSocket] that share a reply channel.
///
/// Requests still pending when the batch is dropped are forgotten by the socket.
#[derive(Debug)]
pub(crate) struct RequestBatch<'a> {
    socket: &'a RpcSocket,
    sender: Sender<Reply>,
    receiver: Receiver<Reply>,
    pending: HashMap<u32, (PeerAddress, Instant)>,
}

impl<'a> RequestBatch<'a> {
    pub fn new(socket: &'a RpcSocket) -> Self {
        let (sender, receiver) = flume::unbounded();

        Self {
            socket,
            sender,
            receiver,
            pending: HashMap::new(),
        }
    }

    // === Getters ===

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    // === Public Methods ===

    /// Returns false if the request could not be sent.
    pub fn send(&mut self, to: &PeerAddress, request: RequestSpecific) -> bool {
        match self.socket.request(to, request, &self.sender) {
            Some(tid) => {
                self.pending.insert(tid, (to.clone(), Instant::now()));
                true
            }
            None => false,
        }
    }

    /// Wait for the next reply until `deadline`.
    pub fn next(&mut self, deadline: Instant, shutdown: &Shutdown) -> Event {
        let event = Selector::new()
            .recv(&self.receiver, |reply| match reply {
                Ok(reply) => Event::Reply(reply),
                // We hold a sender, so this never disconnects.
                Err(_) => Event::Shutdown,
            })
            .recv(shutdown.receiver(), |_| Event::Shutdown)
            .wait_deadline(deadline)
            .unwrap_or(Event::Timeout);

        if let Event::Reply(reply) = &event {
            self.pending.remove(&reply.transaction_id);
        }

        event
    }

    /// When the oldest pending request times out.
    pub fn next_expiry(&self, timeout: Duration) -> Option<Instant> {
        self.pending
            .values()
            .map(|(_, sent_at)| *sent_at + timeout)
            .min()
    }

    /// Remove and return the peers of requests older than `timeout`.
    pub fn expire(&mut self, timeout: Duration) -> Vec<PeerAddress> {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, (_, sent_at))| now.duration_since(*sent_at) >= timeout)
            .map(|(tid, _)| *tid)
            .collect();

        expired
            .into_iter()
            .filter_map(|tid| {
                self.socket.forget(tid);
                self.pending.remove(&tid).map(|(peer, _)| peer)
            })
            .collect()
    }

    /// Wait for the first reply `accept` returns true for.
    pub fn await_first(
        &mut self,
        timeout: Duration,
        shutdown: &Shutdown,
        mut accept: impl FnMut(&Reply) -> bool,
    ) -> Option<Reply> {
        let deadline = Instant::now() + timeout;

        while !self.pending.is_empty() {
            match self.next(deadline, shutdown) {
                Event::Reply(reply) if accept(&reply) => return Some(reply),
                Event::Reply(_) => {}
                Event::Timeout | Event::Shutdown => return None,
            }
        }

        None
    }

    /// Collect replies until every request was answered, or the timeout.
    pub fn await_all(&mut self, timeout: Duration, shutdown: &Shutdown) -> Vec<Reply> {
        let deadline = Instant::now() + timeout;
        let mut replies = Vec::with_capacity(self.pending.len());

        while !self.pending.is_empty() {
            match self.next(deadline, shutdown) {
                Event::Reply(reply) => replies.push(reply),
                Event::Timeout | Event::Shutdown => break,
            }
        }

        replies
    }

    /// Give up on every pending request, returning the peers that didn't answer.
    pub fn into_unanswered(mut self) -> Vec<PeerAddress> {
        let socket = self.socket;

        self.pending
            .drain()
            .map(|(tid, (peer, _))| {
                socket.forget(tid);
                peer
            })
            .collect()
    }
}

impl Drop for RequestBatch<'_> {
    fn drop(&mut self) {
        for tid in self.pending.keys() {
            self.socket.forget(*tid);
        }
    }
}
