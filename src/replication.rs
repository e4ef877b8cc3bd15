//! Periodic re-storing of local items on their current closest peers, spreading
//! delete requests on the way.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::common::{DeleteRequest, PeerAddress, RequestSpecific, ResponseSpecific, StorableItem};
use crate::rpc::{NetworkStatus, RequestBatch, Rpc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// What one replication cycle did.
pub struct ReplicationReport {
    /// Items replicated to at least one peer.
    pub replicated: usize,
    /// Items skipped because another peer stored them since the last cycle.
    pub skipped: usize,
    /// Items a peer answered with a delete request for.
    pub deleted: usize,
}

pub(crate) fn run(rpc: &Rpc) {
    loop {
        if rpc.shutdown().sleep(next_wait(rpc)) {
            break;
        }

        if rpc.status() != NetworkStatus::Ready {
            continue;
        }

        let report = replicate(rpc);
        info!(?report, "Replication cycle done");
    }

    debug!("Replication loop stopped");
}

/// `replication_interval` plus or minus a random jitter.
fn next_wait(rpc: &Rpc) -> Duration {
    let config = rpc.config();
    let jitter = config.replication_jitter.as_millis() as u64;
    let offset = rand::thread_rng().gen_range(0..=jitter.saturating_mul(2));

    (config.replication_interval + Duration::from_millis(offset))
        .saturating_sub(config.replication_jitter)
}

/// One replication cycle.
pub(crate) fn replicate(rpc: &Rpc) -> ReplicationReport {
    let mut report = ReplicationReport::default();
    let skip = rpc.take_recently_stored();

    // Refresh our neighborhood so the targets are current.
    rpc.lookup(*rpc.id());

    for (item_type, handler) in rpc.storage().iter() {
        let items = match handler.items() {
            Ok(items) => items,
            Err(error) => {
                debug!(?item_type, ?error, "Failed to list items for replication");
                continue;
            }
        };

        for item in items {
            if rpc.shutdown().is_triggered() {
                return report;
            }

            if skip.contains(&(item_type, *item.key())) {
                report.skipped += 1;
                continue;
            }

            let targets: Vec<PeerAddress> = rpc
                .closest_peers(item.key(), rpc.config().k)
                .into_iter()
                .filter(|peer| peer != rpc.address())
                .collect();

            let mut contacted = 0;
            let mut delete_request = None;

            for target in &targets {
                contacted += 1;

                if let Some(request) = store_and_wait(rpc, target, &item) {
                    debug!(from = ?target, key = ?item.key(), "Item was deleted, stopping replication");
                    delete_request = Some(request);
                    break;
                }
            }

            match delete_request {
                Some(request) => {
                    for target in &targets[contacted..] {
                        rpc.socket()
                            .send_one_way(target, RequestSpecific::Delete(request.clone()));
                    }

                    if let Err(error) = handler.delete(&request) {
                        debug!(?error, key = ?item.key(), "Failed to delete local item");
                    }

                    report.deleted += 1;
                }
                None if contacted > 0 => report.replicated += 1,
                None => {}
            }
        }
    }

    report
}

/// Send a store request and wait briefly for a delete request in response.
fn store_and_wait(
    rpc: &Rpc,
    target: &PeerAddress,
    item: &StorableItem,
) -> Option<DeleteRequest> {
    let mut batch = RequestBatch::new(rpc.socket());

    if !batch.send(target, RequestSpecific::Store(item.clone())) {
        return None;
    }

    let reply = batch.await_first(rpc.config().replication_wait, rpc.shutdown(), |_| true)?;

    match reply.response {
        Ok(ResponseSpecific::DeleteRequest(request))
            if request.key == *item.key() && request.item_type == item.item_type() =>
        {
            Some(request)
        }
        _ => None,
    }
}
