//! Serialize and deserialize DHT wire messages.
//!
//! Every message is a bencoded dictionary correlated by a 4 bytes transaction id.

mod internal;

use std::convert::TryInto;

use bytes::Bytes;

use crate::common::{DeleteRequest, Id, ItemType, PeerAddress, StorableItem};
use crate::{Error, Result};

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u32,
    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    /// Ask for the peers closest to `key` that the responder knows of.
    FindClosePeers { key: Id },
    Store(StorableItem),
    Retrieve { key: Id, item_type: ItemType },
    Delete(DeleteRequest),
    /// Ask whether the responder knows a delete authorization for `key`.
    DeletionQuery { key: Id },
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    PeerList(Vec<PeerAddress>),
    /// Answer to a retrieve request, `None` if the responder doesn't hold the item.
    Item(Option<StorableItem>),
    DeletionInfo {
        key: Id,
        authorization: Option<Bytes>,
    },
    /// Sent in response to a store request for an item the responder knows was deleted.
    DeleteRequest(DeleteRequest),
    /// Acknowledges a store or delete request.
    Ack { key: Id },
}

impl RequestSpecific {
    /// The key this request is about.
    pub fn key(&self) -> &Id {
        match self {
            RequestSpecific::FindClosePeers { key } => key,
            RequestSpecific::Store(item) => item.key(),
            RequestSpecific::Retrieve { key, .. } => key,
            RequestSpecific::Delete(request) => &request.key,
            RequestSpecific::DeletionQuery { key } => key,
        }
    }
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            variant: match self.message_type {
                MessageType::Request(request) => {
                    internal::DHTMessageVariant::Request(match request {
                        RequestSpecific::FindClosePeers { key } => {
                            internal::DHTRequestSpecific::FindClosePeers {
                                arguments: internal::DHTKeyArguments { key: key.to_vec() },
                            }
                        }
                        RequestSpecific::Store(item) => internal::DHTRequestSpecific::Store {
                            arguments: item.into(),
                        },
                        RequestSpecific::Retrieve { key, item_type } => {
                            internal::DHTRequestSpecific::Retrieve {
                                arguments: internal::DHTRetrieveArguments {
                                    key: key.to_vec(),
                                    item_type: item_type.0,
                                },
                            }
                        }
                        RequestSpecific::Delete(request) => internal::DHTRequestSpecific::Delete {
                            arguments: request.into(),
                        },
                        RequestSpecific::DeletionQuery { key } => {
                            internal::DHTRequestSpecific::DeletionQuery {
                                arguments: internal::DHTKeyArguments { key: key.to_vec() },
                            }
                        }
                    })
                }
                MessageType::Response(response) => {
                    internal::DHTMessageVariant::Response(match response {
                        ResponseSpecific::PeerList(peers) => {
                            internal::DHTResponseSpecific::PeerList {
                                arguments: internal::DHTPeerListArguments {
                                    peers: peers
                                        .iter()
                                        .map(|peer| peer.as_bytes().to_vec().into())
                                        .collect(),
                                },
                            }
                        }
                        ResponseSpecific::Item(item) => internal::DHTResponseSpecific::Item {
                            arguments: internal::DHTItemArguments {
                                item: item.map(|item| item.into()),
                            },
                        },
                        ResponseSpecific::DeletionInfo { key, authorization } => {
                            internal::DHTResponseSpecific::DeletionInfo {
                                arguments: internal::DHTDeletionInfoArguments {
                                    key: key.to_vec(),
                                    authorization: authorization.map(|a| a.to_vec()),
                                },
                            }
                        }
                        ResponseSpecific::DeleteRequest(request) => {
                            internal::DHTResponseSpecific::DeleteRequest {
                                arguments: request.into(),
                            }
                        }
                        ResponseSpecific::Ack { key } => internal::DHTResponseSpecific::Ack {
                            arguments: internal::DHTKeyArguments { key: key.to_vec() },
                        },
                    })
                }
                MessageType::Error(error) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: (error.code, error.description),
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        Ok(Message {
            transaction_id: transaction_id(&msg.transaction_id)?,
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(request) => {
                    MessageType::Request(match request {
                        internal::DHTRequestSpecific::FindClosePeers { arguments } => {
                            RequestSpecific::FindClosePeers {
                                key: Id::from_bytes(arguments.key)?,
                            }
                        }
                        internal::DHTRequestSpecific::Store { arguments } => {
                            RequestSpecific::Store(arguments.try_into()?)
                        }
                        internal::DHTRequestSpecific::Retrieve { arguments } => {
                            RequestSpecific::Retrieve {
                                key: Id::from_bytes(arguments.key)?,
                                item_type: ItemType(arguments.item_type),
                            }
                        }
                        internal::DHTRequestSpecific::Delete { arguments } => {
                            RequestSpecific::Delete(arguments.try_into()?)
                        }
                        internal::DHTRequestSpecific::DeletionQuery { arguments } => {
                            RequestSpecific::DeletionQuery {
                                key: Id::from_bytes(arguments.key)?,
                            }
                        }
                    })
                }
                internal::DHTMessageVariant::Response(response) => {
                    MessageType::Response(match response {
                        internal::DHTResponseSpecific::PeerList { arguments } => {
                            ResponseSpecific::PeerList(
                                arguments
                                    .peers
                                    .into_iter()
                                    .filter(|bytes| !bytes.is_empty())
                                    .map(|bytes| PeerAddress::new(bytes.into_vec()))
                                    .collect(),
                            )
                        }
                        internal::DHTResponseSpecific::Item { arguments } => {
                            ResponseSpecific::Item(match arguments.item {
                                Some(item) => Some(item.try_into()?),
                                None => None,
                            })
                        }
                        internal::DHTResponseSpecific::DeletionInfo { arguments } => {
                            ResponseSpecific::DeletionInfo {
                                key: Id::from_bytes(arguments.key)?,
                                authorization: arguments.authorization.map(Bytes::from),
                            }
                        }
                        internal::DHTResponseSpecific::DeleteRequest { arguments } => {
                            ResponseSpecific::DeleteRequest(arguments.try_into()?)
                        }
                        internal::DHTResponseSpecific::Ack { arguments } => ResponseSpecific::Ack {
                            key: Id::from_bytes(arguments.key)?,
                        },
                    })
                }
                internal::DHTMessageVariant::Error(error) => MessageType::Error(ErrorSpecific {
                    code: error.error_info.0,
                    description: error.error_info.1,
                }),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    /// Transaction id of a response or error, read from its envelope alone.
    ///
    /// Lets a reply whose body fails to decode still fail its request right away.
    /// Returns `None` for requests and for packets without a readable envelope.
    pub(crate) fn reply_transaction_id<T: AsRef<[u8]>>(bytes: T) -> Option<u32> {
        let envelope = internal::DHTEnvelope::from_bytes(bytes.as_ref()).ok()?;

        match envelope.kind.as_str() {
            "r" | "e" => transaction_id(&envelope.transaction_id).ok(),
            _ => None,
        }
    }
}

fn transaction_id(bytes: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::InvalidMessage("transaction_id is not 4 bytes"))?;

    Ok(u32::from_be_bytes(bytes))
}

impl From<StorableItem> for internal::DHTItem {
    fn from(item: StorableItem) -> Self {
        internal::DHTItem {
            item_type: item.item_type().0,
            key: item.key().to_vec(),
            payload: item.payload().to_vec(),
        }
    }
}

impl TryFrom<internal::DHTItem> for StorableItem {
    type Error = Error;

    fn try_from(item: internal::DHTItem) -> Result<Self> {
        Ok(StorableItem::new(
            ItemType(item.item_type),
            Id::from_bytes(item.key)?,
            item.payload,
        ))
    }
}

impl From<DeleteRequest> for internal::DHTDeleteArguments {
    fn from(request: DeleteRequest) -> Self {
        internal::DHTDeleteArguments {
            item_type: request.item_type.0,
            key: request.key.to_vec(),
            authorization: request.authorization.to_vec(),
        }
    }
}

impl TryFrom<internal::DHTDeleteArguments> for DeleteRequest {
    type Error = Error;

    fn try_from(arguments: internal::DHTDeleteArguments) -> Result<Self> {
        Ok(DeleteRequest::new(
            ItemType(arguments.item_type),
            Id::from_bytes(arguments.key)?,
            arguments.authorization,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_request() {
        let message = Message {
            transaction_id: 258,
            message_type: MessageType::Request(RequestSpecific::Store(
                StorableItem::content_addressed(ItemType::EMAIL_PACKET, &b"encrypted mail"[..]),
            )),
        };

        let parsed = Message::from_bytes(message.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed, message);
    }

    #[test]
    fn peer_list_response() {
        let peers = vec![
            PeerAddress::new(&b"alice"[..]),
            PeerAddress::new(&b"bob"[..]),
        ];

        let message = Message {
            transaction_id: u32::MAX,
            message_type: MessageType::Response(ResponseSpecific::PeerList(peers)),
        };

        let parsed = Message::from_bytes(message.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed, message);
    }

    #[test]
    fn empty_retrieve_response() {
        let message = Message {
            transaction_id: 7,
            message_type: MessageType::Response(ResponseSpecific::Item(None)),
        };

        let parsed = Message::from_bytes(message.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed, message);
    }

    #[test]
    fn reject_invalid_key_length() {
        let bytes = b"d1:ad1:k3:abce1:q16:find_close_peers1:t4:\x00\x00\x00\x011:y1:qe";

        assert!(matches!(
            Message::from_bytes(bytes),
            Err(Error::InvalidIdSize(3))
        ));
    }

    #[test]
    fn transaction_id_of_malformed_reply() {
        let response = b"d1:rd1:k3:abce1:t4:\x00\x00\x01\x021:y1:re";
        assert!(Message::from_bytes(response).is_err());
        assert_eq!(Message::reply_transaction_id(response), Some(258));

        let error = b"d1:eli203e4:oopse1:t4:\x00\x00\x00\x091:y1:ee";
        assert_eq!(Message::reply_transaction_id(error), Some(9));

        let request = b"d1:ad1:k3:abce1:q16:find_close_peers1:t4:\x00\x00\x00\x011:y1:qe";
        assert_eq!(Message::reply_transaction_id(request), None);

        assert_eq!(Message::reply_transaction_id(b"not bencode"), None);
    }

    #[test]
    fn reject_garbage() {
        assert!(Message::from_bytes(b"not bencode").is_err());
    }
}
