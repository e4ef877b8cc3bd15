//! Transport layer wrapper managing outgoing requests and correlating their responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use flume::Sender;
use tracing::{debug, trace};

use crate::common::{
    ErrorSpecific, Message, MessageType, PeerAddress, RequestSpecific, ResponseSpecific,
};
use crate::transport::Transport;

/// A response (or error) correlated to one of our requests.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub transaction_id: u32,
    pub from: PeerAddress,
    pub response: Result<ResponseSpecific, ErrorSpecific>,
}

#[derive(Debug)]
struct InflightRequest {
    to: PeerAddress,
    sent_at: Instant,
    reply: Sender<Reply>,
}

/// Formats and correlates DHT requests and responses over a [Transport].
///
/// Safe to share between threads, and never holds a lock while calling the transport,
/// which may deliver a response before `send` even returns.
#[derive(Debug)]
pub(crate) struct RpcSocket {
    transport: Arc<dyn Transport>,
    next_tid: AtomicU32,
    inflight_requests: Mutex<HashMap<u32, InflightRequest>>,
}

impl RpcSocket {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_tid: AtomicU32::new(rand::random()),
            inflight_requests: Mutex::new(HashMap::new()),
        }
    }

    // === Public Methods ===

    /// Returns true if this transaction_id is still inflight
    pub fn inflight(&self, transaction_id: u32) -> bool {
        self.inflight_requests().contains_key(&transaction_id)
    }

    /// Number of requests waiting for a response.
    pub fn inflight_len(&self) -> usize {
        self.inflight_requests().len()
    }

    /// Send a request, the response will be delivered to `reply`.
    ///
    /// Returns the transaction_id, or `None` if the transport failed to send.
    pub fn request(
        &self,
        to: &PeerAddress,
        request: RequestSpecific,
        reply: &Sender<Reply>,
    ) -> Option<u32> {
        let tid = self.tid();

        self.inflight_requests().insert(
            tid,
            InflightRequest {
                to: to.clone(),
                sent_at: Instant::now(),
                reply: reply.clone(),
            },
        );

        let message = Message {
            transaction_id: tid,
            message_type: MessageType::Request(request),
        };

        if self.send(to, message) {
            Some(tid)
        } else {
            self.forget(tid);
            None
        }
    }

    /// Send a request without waiting for its response, which gets dropped when it arrives.
    pub fn send_one_way(&self, to: &PeerAddress, request: RequestSpecific) -> bool {
        let message = Message {
            transaction_id: self.tid(),
            message_type: MessageType::Request(request),
        };

        self.send(to, message)
    }

    /// Send a response to the given peer.
    pub fn response(&self, to: &PeerAddress, transaction_id: u32, response: ResponseSpecific) {
        self.send(
            to,
            Message {
                transaction_id,
                message_type: MessageType::Response(response),
            },
        );
    }

    /// Send an error to the given peer.
    pub fn error(&self, to: &PeerAddress, transaction_id: u32, error: ErrorSpecific) {
        self.send(
            to,
            Message {
                transaction_id,
                message_type: MessageType::Error(error),
            },
        );
    }

    /// Stop waiting for a request, a late response will be dropped.
    pub fn forget(&self, transaction_id: u32) {
        self.inflight_requests().remove(&transaction_id);
    }

    /// Deliver a response or an error to whoever is waiting for it.
    ///
    /// Returns false if it doesn't match an inflight request sent to `from`.
    pub fn correlate(&self, message: Message, from: &PeerAddress) -> bool {
        let response = match message.message_type {
            MessageType::Response(response) => Ok(response),
            MessageType::Error(error) => Err(error),
            MessageType::Request(_) => return false,
        };

        let request = {
            let mut inflight_requests = self.inflight_requests();

            match inflight_requests.get(&message.transaction_id) {
                Some(request) if &request.to == from => {
                    inflight_requests.remove(&message.transaction_id)
                }
                Some(_) => {
                    trace!(context = "socket_validation", ?from, "Response from wrong peer");
                    return false;
                }
                None => {
                    trace!(
                        context = "socket_validation",
                        ?from,
                        "Unexpected response id"
                    );
                    return false;
                }
            }
        };

        if let Some(request) = request {
            trace!(
                context = "socket_message_receiving",
                ?from,
                rtt = ?request.sent_at.elapsed(),
                "Received response"
            );

            // The waiting side may have given up already.
            let _ = request.reply.send(Reply {
                transaction_id: message.transaction_id,
                from: from.clone(),
                response,
            });

            return true;
        }

        false
    }

    // === Private Methods ===

    fn inflight_requests(&self) -> MutexGuard<'_, HashMap<u32, InflightRequest>> {
        self.inflight_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tid(&self) -> u32 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, to: &PeerAddress, message: Message) -> bool {
        trace!(context = "socket_message_sending", ?to, ?message);

        let packet = match message.to_bytes() {
            Ok(packet) => packet,
            Err(error) => {
                debug!(?error, "Failed to encode message");
                return false;
            }
        };

        match self.transport.send(to, &packet) {
            Ok(()) => true,
            Err(error) => {
                debug!(?error, ?to, "Error sending message");
                false
            }
        }
    }
}
