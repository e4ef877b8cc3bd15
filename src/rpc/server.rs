//! Answering inbound requests from the local routing table and storage handlers.

use tracing::debug;

use crate::common::{
    DeleteRequest, ErrorSpecific, Id, ItemType, PeerAddress, RequestSpecific, ResponseSpecific,
    StorableItem,
};
use crate::storage::StorageError;

use super::Rpc;

/// Error code for a request a storage handler failed to serve for its own reasons.
pub const ERROR_GENERIC: i32 = 201;
/// Error code for a local I/O failure of a storage handler.
pub const ERROR_SERVER: i32 = 202;
/// Error code for a request that makes no sense.
pub const ERROR_PROTOCOL: i32 = 203;
/// Error code for a request about an item type we don't store.
pub const ERROR_UNKNOWN_ITEM_TYPE: i32 = 204;

type ServerResult = Result<ResponseSpecific, ErrorSpecific>;

pub(crate) fn handle_request(
    rpc: &Rpc,
    from: &PeerAddress,
    transaction_id: u32,
    request: RequestSpecific,
) {
    let key = *request.key();

    let result = match request {
        RequestSpecific::FindClosePeers { key } => Ok(find_close_peers(rpc, from, &key)),
        RequestSpecific::Store(item) => store(rpc, item),
        RequestSpecific::Retrieve { key, item_type } => retrieve(rpc, &key, item_type),
        RequestSpecific::Delete(request) => delete(rpc, request),
        RequestSpecific::DeletionQuery { key } => Ok(deletion_query(rpc, key)),
    };

    match result {
        Ok(response) => rpc.socket().response(from, transaction_id, response),
        Err(error) => {
            debug!(?from, ?key, ?error, "Failed to serve request");
            rpc.socket().error(from, transaction_id, error)
        }
    }
}

fn find_close_peers(rpc: &Rpc, from: &PeerAddress, key: &Id) -> ResponseSpecific {
    let k = rpc.config().k;

    let mut peers = rpc.closest_peers(key, k + 1);
    peers.retain(|peer| peer != from);
    peers.truncate(k);

    ResponseSpecific::PeerList(peers)
}

fn store(rpc: &Rpc, item: StorableItem) -> ServerResult {
    let item_type = item.item_type();
    let key = *item.key();
    let handler = rpc
        .storage()
        .get(item_type)
        .ok_or_else(|| unknown_item_type(item_type))?;

    match handler
        .store_or_get_delete_request(item)
        .map_err(server_error)?
    {
        Some(delete_request) => Ok(ResponseSpecific::DeleteRequest(delete_request)),
        None => {
            rpc.mark_recently_stored(item_type, key);

            Ok(ResponseSpecific::Ack { key })
        }
    }
}

fn retrieve(rpc: &Rpc, key: &Id, item_type: ItemType) -> ServerResult {
    let handler = rpc
        .storage()
        .get(item_type)
        .ok_or_else(|| unknown_item_type(item_type))?;

    let item = handler.retrieve(key).map_err(server_error)?;

    Ok(ResponseSpecific::Item(item))
}

fn delete(rpc: &Rpc, request: DeleteRequest) -> ServerResult {
    let handler = rpc
        .storage()
        .get(request.item_type)
        .ok_or_else(|| unknown_item_type(request.item_type))?;

    handler.delete(&request).map_err(server_error)?;

    Ok(ResponseSpecific::Ack { key: request.key })
}

fn deletion_query(rpc: &Rpc, key: Id) -> ResponseSpecific {
    let authorization = rpc
        .storage()
        .iter()
        .find_map(|(item_type, handler)| match handler.delete_authorization(&key) {
            Ok(authorization) => authorization,
            Err(error) => {
                debug!(?item_type, ?error, "Storage handler failed deletion query");
                None
            }
        });

    ResponseSpecific::DeletionInfo { key, authorization }
}

fn unknown_item_type(item_type: ItemType) -> ErrorSpecific {
    ErrorSpecific {
        code: ERROR_UNKNOWN_ITEM_TYPE,
        description: format!("Unknown item type {item_type}"),
    }
}

fn server_error(error: StorageError) -> ErrorSpecific {
    match error {
        StorageError::Rejected(reason) => ErrorSpecific {
            code: ERROR_PROTOCOL,
            description: reason,
        },
        StorageError::IO(error) => ErrorSpecific {
            code: ERROR_SERVER,
            description: error.to_string(),
        },
        StorageError::Other(error) => ErrorSpecific {
            code: ERROR_GENERIC,
            description: error.to_string(),
        },
    }
}
