use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(flatten)]
    pub variant: DHTMessageVariant,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

/// Only the fields every message carries, to salvage the transaction id of a
/// message whose body doesn't decode.
#[derive(Deserialize, Debug)]
pub struct DHTEnvelope {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(rename = "y")]
    pub kind: String,
}

impl DHTEnvelope {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTEnvelope, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum DHTMessageVariant {
    #[serde(rename = "q")]
    Request(DHTRequestSpecific),

    #[serde(rename = "r")]
    Response(DHTResponseSpecific),

    #[serde(rename = "e")]
    Error(DHTErrorSpecific),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum DHTRequestSpecific {
    #[serde(rename = "find_close_peers")]
    FindClosePeers {
        #[serde(rename = "a")]
        arguments: DHTKeyArguments,
    },

    #[serde(rename = "store")]
    Store {
        #[serde(rename = "a")]
        arguments: DHTItem,
    },

    #[serde(rename = "retrieve")]
    Retrieve {
        #[serde(rename = "a")]
        arguments: DHTRetrieveArguments,
    },

    #[serde(rename = "delete")]
    Delete {
        #[serde(rename = "a")]
        arguments: DHTDeleteArguments,
    },

    #[serde(rename = "deletion_query")]
    DeletionQuery {
        #[serde(rename = "a")]
        arguments: DHTKeyArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "k")]
pub enum DHTResponseSpecific {
    #[serde(rename = "peers")]
    PeerList {
        #[serde(rename = "r")]
        arguments: DHTPeerListArguments,
    },

    #[serde(rename = "item")]
    Item {
        #[serde(rename = "r")]
        arguments: DHTItemArguments,
    },

    #[serde(rename = "deletion_info")]
    DeletionInfo {
        #[serde(rename = "r")]
        arguments: DHTDeletionInfoArguments,
    },

    #[serde(rename = "delete")]
    DeleteRequest {
        #[serde(rename = "r")]
        arguments: DHTDeleteArguments,
    },

    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "r")]
        arguments: DHTKeyArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTErrorSpecific {
    #[serde(rename = "e")]
    pub error_info: (i32, String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTKeyArguments {
    #[serde(rename = "k", with = "serde_bytes")]
    pub key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTItem {
    #[serde(rename = "type")]
    pub item_type: u8,

    #[serde(rename = "k", with = "serde_bytes")]
    pub key: Vec<u8>,

    #[serde(rename = "v", with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTRetrieveArguments {
    #[serde(rename = "k", with = "serde_bytes")]
    pub key: Vec<u8>,

    #[serde(rename = "type")]
    pub item_type: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTDeleteArguments {
    #[serde(rename = "type")]
    pub item_type: u8,

    #[serde(rename = "k", with = "serde_bytes")]
    pub key: Vec<u8>,

    #[serde(rename = "auth", with = "serde_bytes")]
    pub authorization: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTPeerListArguments {
    #[serde(rename = "p")]
    pub peers: Vec<ByteBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTItemArguments {
    #[serde(default)]
    #[serde(rename = "i", skip_serializing_if = "Option::is_none")]
    pub item: Option<DHTItem>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTDeletionInfoArguments {
    #[serde(rename = "k", with = "serde_bytes")]
    pub key: Vec<u8>,

    #[serde(default)]
    #[serde(
        rename = "auth",
        with = "serde_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub authorization: Option<Vec<u8>>,
}
