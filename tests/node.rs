use std::fs;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use maildht::rpc::{NetworkStatus, ERROR_GENERIC, ERROR_UNKNOWN_ITEM_TYPE};
use maildht::{
    Dht, Error, Id, ItemType, MemoryStorage, Message, MessageType, PeerAddress, PeerFilter,
    RequestSpecific, ResponseSpecific, StorableItem, StorageError, StorageHandler, Transport,
    TransportError,
};

/// Records every message instead of sending it.
///
/// Once attached to a node, answers its find-close-peers requests with an empty peer list.
#[derive(Debug, Default)]
struct Recorder {
    sent: Mutex<Vec<(PeerAddress, Message)>>,
    node: Mutex<Option<Dht>>,
}

impl Recorder {
    fn sent(&self) -> Vec<(PeerAddress, Message)> {
        self.sent.lock().unwrap().clone()
    }

    /// Keys of the find-close-peers requests sent to `peer`.
    fn lookups_to(&self, peer: &PeerAddress) -> Vec<Id> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == peer)
            .filter_map(|(_, message)| match message.message_type {
                MessageType::Request(RequestSpecific::FindClosePeers { key }) => Some(key),
                _ => None,
            })
            .collect()
    }

    fn answer_for(&self, dht: &Dht) {
        *self.node.lock().unwrap() = Some(dht.clone());
    }

    fn stop_answering(&self) {
        self.node.lock().unwrap().take();
    }
}

impl Transport for Recorder {
    fn send(&self, to: &PeerAddress, packet: &[u8]) -> Result<(), TransportError> {
        let message = Message::from_bytes(packet).map_err(io::Error::other)?;
        self.sent.lock().unwrap().push((to.clone(), message.clone()));

        let node = self.node.lock().unwrap().clone();

        if let (Some(node), MessageType::Request(RequestSpecific::FindClosePeers { .. })) =
            (node, &message.message_type)
        {
            let response = Message {
                transaction_id: message.transaction_id,
                message_type: MessageType::Response(ResponseSpecific::PeerList(vec![])),
            };

            node.handle_packet(&response.to_bytes().unwrap(), to.clone(), Instant::now());
        }

        Ok(())
    }
}

/// Fails every store.
#[derive(Debug)]
struct FailingStorage;

impl StorageHandler for FailingStorage {
    fn retrieve(&self, _key: &Id) -> Result<Option<StorableItem>, StorageError> {
        Ok(None)
    }

    fn store(&self, _item: StorableItem) -> Result<(), StorageError> {
        Err(StorageError::Other("disk full".into()))
    }

    fn items(&self) -> Result<Vec<StorableItem>, StorageError> {
        Ok(vec![])
    }
}

#[derive(Debug)]
struct BanList(Vec<PeerAddress>);

impl PeerFilter for BanList {
    fn is_banned(&self, peer: &PeerAddress) -> bool {
        self.0.contains(peer)
    }
}

/// Prints the node's logs when `MAILDHT_TEST_LOG` is set.
fn init_logging() {
    if std::env::var_os("MAILDHT_TEST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }
}

fn address(name: &str) -> PeerAddress {
    PeerAddress::new(name.as_bytes().to_vec())
}

fn request(transaction_id: u32, request: RequestSpecific) -> Vec<u8> {
    Message {
        transaction_id,
        message_type: MessageType::Request(request),
    }
    .to_bytes()
    .unwrap()
}

#[test]
fn build_requires_a_transport() {
    init_logging();

    assert!(matches!(
        Dht::builder(address("local")).build(),
        Err(Error::IO(_))
    ));
}

#[test]
fn store_without_peers() {
    init_logging();

    let recorder = Arc::new(Recorder::default());
    let dht = Dht::builder(address("local"))
        .transport(recorder.clone())
        .storage(
            ItemType::EMAIL_PACKET,
            Arc::new(MemoryStorage::new(ItemType::EMAIL_PACKET)),
        )
        .build()
        .unwrap();

    assert_eq!(dht.status(), NetworkStatus::NotStarted);

    let item = StorableItem::content_addressed(ItemType::EMAIL_PACKET, "nobody home");

    assert!(matches!(dht.store(item), Err(Error::NoStorageNodes)));
    assert!(recorder.sent().is_empty());
}

#[test]
fn answers_inbound_requests() {
    init_logging();

    let recorder = Arc::new(Recorder::default());
    let dht = Dht::builder(address("local"))
        .transport(recorder.clone())
        .storage(
            ItemType::INDEX_PACKET,
            Arc::new(MemoryStorage::new(ItemType::INDEX_PACKET)),
        )
        .build()
        .unwrap();

    let remote = address("remote");
    let item = StorableItem::content_addressed(ItemType::INDEX_PACKET, "payload");

    dht.handle_packet(
        &request(1, RequestSpecific::Store(item.clone())),
        remote.clone(),
        Instant::now(),
    );
    dht.handle_packet(
        &request(
            2,
            RequestSpecific::Retrieve {
                key: *item.key(),
                item_type: ItemType::EMAIL_PACKET,
            },
        ),
        remote.clone(),
        Instant::now(),
    );

    let sent = recorder.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(to, _)| to == &remote));

    assert_eq!(
        sent[0].1.message_type,
        MessageType::Response(ResponseSpecific::Ack { key: *item.key() })
    );
    assert!(matches!(
        &sent[1].1.message_type,
        MessageType::Error(error) if error.code == ERROR_UNKNOWN_ITEM_TYPE
    ));

    // The requester is now a known peer.
    assert_eq!(dht.peers().len(), 1);

    // And the stored item is found without asking anyone.
    let found = dht.find_one(*item.key(), ItemType::INDEX_PACKET).unwrap();
    assert_eq!(found, Some(item));
    assert_eq!(recorder.sent().len(), 2);
}

#[test]
fn malformed_reply_fails_its_request() {
    init_logging();

    let recorder = Arc::new(Recorder::default());
    let remote = address("remote");

    let dht = Dht::builder(address("local"))
        .transport(recorder.clone())
        .request_timeout(Duration::from_secs(3))
        .build()
        .unwrap();
    dht.add_peer(remote.clone());

    let started = Instant::now();
    let lookup = {
        let dht = dht.clone();
        thread::spawn(move || dht.find_close_peers(Id::random()).unwrap())
    };

    let deadline = Instant::now() + Duration::from_secs(2);
    let transaction_id = loop {
        if let Some((_, message)) = recorder.sent().first() {
            break message.transaction_id;
        }
        assert!(Instant::now() < deadline, "lookup sent nothing");
        sleep(Duration::from_millis(5));
    };

    // A response to the right transaction with a 3 bytes key.
    let mut packet = b"d1:rd1:k3:abce1:t4:".to_vec();
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(b"1:y1:re");
    assert!(Message::from_bytes(&packet).is_err());

    dht.handle_packet(&packet, remote.clone(), Instant::now());

    assert!(lookup.join().unwrap().is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));

    let peers = dht.peers();
    assert_eq!(peers[0].consecutive_timeouts(), 1);
}

#[test]
fn malformed_reply_from_another_peer_is_ignored() {
    init_logging();

    let recorder = Arc::new(Recorder::default());
    let remote = address("remote");

    let dht = Dht::builder(address("local"))
        .transport(recorder.clone())
        .request_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    dht.add_peer(remote.clone());

    let lookup = {
        let dht = dht.clone();
        thread::spawn(move || dht.find_close_peers(Id::random()).unwrap())
    };

    while recorder.sent().is_empty() {
        sleep(Duration::from_millis(5));
    }
    let transaction_id = recorder.sent()[0].1.transaction_id;

    let mut packet = b"d1:rd1:k3:abce1:t4:".to_vec();
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(b"1:y1:re");

    // Only the peer the request went to can fail it, the lookup waits for its timeout.
    let started = Instant::now();
    dht.handle_packet(&packet, address("stranger"), Instant::now());
    lookup.join().unwrap();

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(dht.peers().iter().all(|peer| peer.address() != &address("stranger")));
}

#[test]
fn storage_failures_are_wire_errors() {
    init_logging();

    let recorder = Arc::new(Recorder::default());
    let dht = Dht::builder(address("local"))
        .transport(recorder.clone())
        .storage(ItemType::EMAIL_PACKET, Arc::new(FailingStorage))
        .build()
        .unwrap();

    let remote = address("remote");

    dht.handle_packet(
        &request(
            1,
            RequestSpecific::Store(StorableItem::content_addressed(
                ItemType::EMAIL_PACKET,
                "mail",
            )),
        ),
        remote.clone(),
        Instant::now(),
    );

    let codes: Vec<i32> = recorder
        .sent()
        .into_iter()
        .filter_map(|(_, message)| match message.message_type {
            MessageType::Error(error) => Some(error.code),
            _ => None,
        })
        .collect();

    assert_eq!(codes, vec![ERROR_GENERIC]);
}

#[test]
fn local_store_failure_still_sends_remote_copies() {
    init_logging();

    let recorder = Arc::new(Recorder::default());
    let remote = address("remote");

    let dht = Dht::builder(address("local"))
        .transport(recorder.clone())
        .storage(ItemType::EMAIL_PACKET, Arc::new(FailingStorage))
        .build()
        .unwrap();
    recorder.answer_for(&dht);
    dht.add_peer(remote.clone());

    let item = StorableItem::content_addressed(ItemType::EMAIL_PACKET, "precious");
    let result = dht.store(item.clone());
    recorder.stop_answering();

    assert!(matches!(result, Err(Error::Storage(StorageError::Other(_)))));

    let stores: Vec<PeerAddress> = recorder
        .sent()
        .into_iter()
        .filter(|(_, message)| {
            message.message_type == MessageType::Request(RequestSpecific::Store(item.clone()))
        })
        .map(|(to, _)| to)
        .collect();
    assert_eq!(stores, vec![remote]);
}

#[test]
fn lookup_stops_once_closer_candidates_run_out() {
    init_logging();

    let recorder = Arc::new(Recorder::default());
    let dht = Dht::builder(address("local"))
        .transport(recorder.clone())
        .k(2)
        .alpha(1)
        .build()
        .unwrap();
    recorder.answer_for(&dht);

    let closest = address("closest");
    let target = *closest.id();

    let (mut near, mut far) = (address("near"), address("far"));
    if far.id().xor(&target) < near.id().xor(&target) {
        std::mem::swap(&mut near, &mut far);
    }

    for peer in [&far, &near, &closest] {
        dht.add_peer(peer.clone());
    }

    let found = dht.find_close_peers(target).unwrap();
    recorder.stop_answering();

    assert_eq!(found, vec![closest.clone(), near.clone()]);
    assert_eq!(recorder.lookups_to(&closest).len(), 1);
    assert_eq!(recorder.lookups_to(&near).len(), 1);
    // Two responses closer than the last candidate, it is never asked.
    assert!(recorder.lookups_to(&far).is_empty());
}

#[test]
fn refresh_looks_up_buckets_and_sibling_sections() {
    init_logging();

    let recorder = Arc::new(Recorder::default());
    let seed = address("seed");

    let dht = Dht::builder(address("local"))
        .transport(recorder.clone())
        .bootstrap(&[seed.clone()])
        .k(20)
        .s(40)
        .maintenance_interval(Duration::from_millis(50))
        .bucket_refresh_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    recorder.answer_for(&dht);

    dht.start().unwrap();
    assert!(dht.bootstrapped());

    // Bootstrapping looks up our own Id, then one key per bucket and per sibling section.
    let keys = recorder.lookups_to(&seed);
    assert_eq!(keys[0], *dht.id());
    assert_eq!(dht.info().buckets(), 1);

    let mut distinct = keys.clone();
    distinct.sort();
    distinct.dedup();
    assert!(distinct.len() >= 1 + 1 + 2);

    // Stale buckets and sections keep getting refreshed.
    let refreshed = keys.len();
    sleep(Duration::from_millis(500));
    assert!(recorder.lookups_to(&seed).len() > refreshed);

    recorder.stop_answering();
    dht.shutdown();
}

#[test]
fn peer_filter_drops_packets() {
    init_logging();

    let recorder = Arc::new(Recorder::default());
    let banned = address("banned");
    let friend = address("friend");

    let dht = Dht::builder(address("local"))
        .transport(recorder.clone())
        .peer_filter(Arc::new(BanList(vec![banned.clone()])))
        .build()
        .unwrap();

    let packet = request(7, RequestSpecific::FindClosePeers { key: Id::random() });

    dht.handle_packet(&packet, banned.clone(), Instant::now());
    dht.add_peer(banned.clone());

    assert!(recorder.sent().is_empty());
    assert!(dht.peers().is_empty());

    dht.handle_packet(&packet, friend.clone(), Instant::now());

    let sent = recorder.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, friend);
    assert_eq!(sent[0].1.transaction_id, 7);
    assert_eq!(
        sent[0].1.message_type,
        MessageType::Response(ResponseSpecific::PeerList(vec![]))
    );

    let peers = dht.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address(), &friend);
}

#[test]
fn peer_file_round_trip() {
    init_logging();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peers.txt");
    let seed = address("seed");

    let dht = Dht::builder(address("first run"))
        .transport(Arc::new(Recorder::default()))
        .peer_file(path.clone())
        .build()
        .unwrap();

    dht.add_peer(seed.clone());
    dht.shutdown();

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.lines().any(|line| line == seed.to_base64()));

    // A restarted node bootstraps from the persisted peers.
    let recorder = Arc::new(Recorder::default());
    let dht = Dht::builder(address("second run"))
        .transport(recorder.clone())
        .peer_file(path.clone())
        .request_timeout(Duration::from_millis(50))
        .bootstrap_retry_interval(Duration::from_millis(20))
        .build()
        .unwrap();

    dht.start().unwrap();
    assert_eq!(dht.status(), NetworkStatus::Bootstrapping);

    let deadline = Instant::now() + Duration::from_secs(5);
    while recorder.sent().is_empty() && Instant::now() < deadline {
        sleep(Duration::from_millis(10));
    }

    let sent = recorder.sent();
    assert!(matches!(
        sent.first(),
        Some((to, Message { message_type: MessageType::Request(RequestSpecific::FindClosePeers { .. }), .. }))
            if to == &seed
    ));

    dht.shutdown();
    assert!(!dht.bootstrapped());
}
