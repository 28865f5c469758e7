use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use parley_protocol::MediaKind;
use parley_server::session::{
    ConsumerRecord, KvOp, MemoryKv, PeerRecord, ProducerRecord, SessionKv, SessionStore,
    TransportRecord,
};

fn store_with_kv(ttl: Duration) -> (SessionStore, Arc<MemoryKv>) {
    let kv = Arc::new(MemoryKv::new());
    (SessionStore::new(kv.clone(), ttl), kv)
}

fn peer_record(room_id: Uuid, connection_id: Uuid, name: &str) -> PeerRecord {
    PeerRecord {
        room_id,
        peer_id: Uuid::new_v4(),
        user_id: None,
        peer_name: name.to_string(),
        connection_id,
        joined_at: Utc::now(),
    }
}

#[tokio::test]
async fn peer_record_roundtrip() {
    let (store, _kv) = store_with_kv(Duration::from_secs(3600));
    let room_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();

    let record = peer_record(room_id, connection_id, "Alice");
    store.put_peer(&record).await.unwrap();

    let loaded = store.get_peer(connection_id).await.unwrap().unwrap();
    assert_eq!(loaded.peer_id, record.peer_id);
    assert_eq!(loaded.peer_name, "Alice");
    assert_eq!(loaded.room_id, room_id);
    assert_eq!(store.room_peers(room_id).await.unwrap(), vec![connection_id]);
}

#[tokio::test]
async fn malformed_peer_record_is_dropped_on_read() {
    let (store, kv) = store_with_kv(Duration::from_secs(3600));
    let connection_id = Uuid::new_v4();
    let key = format!("peer:{connection_id}");

    kv.apply(vec![KvOp::SetEx {
        key: key.clone(),
        value: "{not json".to_string(),
        ttl: Duration::from_secs(3600),
    }])
    .await
    .unwrap();

    assert!(store.get_peer(connection_id).await.unwrap().is_none());
    // The bad record was deleted, not just skipped.
    assert!(kv.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn set_members_without_records_are_pruned() {
    let (store, kv) = store_with_kv(Duration::from_secs(3600));
    let connection_id = Uuid::new_v4();

    let keep = TransportRecord {
        id: Uuid::new_v4(),
        producing: true,
    };
    let lost = TransportRecord {
        id: Uuid::new_v4(),
        producing: false,
    };
    store.add_transport(connection_id, &keep).await.unwrap();
    store.add_transport(connection_id, &lost).await.unwrap();

    // Simulate the record expiring while the set member lingers.
    kv.apply(vec![KvOp::Del {
        key: format!("transport:{}", lost.id),
    }])
    .await
    .unwrap();

    let transports = store.peer_transports(connection_id).await.unwrap();
    assert_eq!(transports.len(), 1);
    assert_eq!(transports[0].id, keep.id);

    let members = kv
        .smembers(&format!("peer:{connection_id}:transports"))
        .await
        .unwrap();
    assert_eq!(members, vec![keep.id.to_string()]);
}

#[tokio::test]
async fn cleanup_peer_removes_every_key() {
    let (store, kv) = store_with_kv(Duration::from_secs(3600));
    let room_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();
    let peer = peer_record(room_id, connection_id, "Alice");

    store.put_peer(&peer).await.unwrap();
    store
        .add_transport(connection_id, &TransportRecord {
            id: Uuid::new_v4(),
            producing: true,
        })
        .await
        .unwrap();
    store
        .add_producer(connection_id, &ProducerRecord {
            id: Uuid::new_v4(),
            kind: MediaKind::Audio,
            peer_id: peer.peer_id,
            connection_id,
        })
        .await
        .unwrap();
    store
        .add_consumer(connection_id, &ConsumerRecord {
            id: Uuid::new_v4(),
            producer_id: Uuid::new_v4(),
            connection_id,
        })
        .await
        .unwrap();
    assert!(!kv.is_empty());

    store.cleanup_peer(connection_id).await.unwrap();
    assert!(kv.is_empty());
}

#[tokio::test(start_paused = true)]
async fn records_expire_after_ttl() {
    let (store, _kv) = store_with_kv(Duration::from_secs(60));
    let room_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();

    store
        .put_peer(&peer_record(room_id, connection_id, "Alice"))
        .await
        .unwrap();
    store
        .set_room_router(room_id, Uuid::new_v4())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(store.get_peer(connection_id).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(store.get_peer(connection_id).await.unwrap().is_none());
    assert!(store.room_router(room_id).await.unwrap().is_none());
    assert!(store.room_peers(room_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn room_router_roundtrip_and_self_heal() {
    let (store, kv) = store_with_kv(Duration::from_secs(3600));
    let room_id = Uuid::new_v4();
    let router_id = Uuid::new_v4();

    store.set_room_router(room_id, router_id).await.unwrap();
    assert_eq!(store.room_router(room_id).await.unwrap(), Some(router_id));

    let key = format!("room:{room_id}:router");
    kv.apply(vec![KvOp::SetEx {
        key: key.clone(),
        value: "not-a-uuid".to_string(),
        ttl: Duration::from_secs(3600),
    }])
    .await
    .unwrap();

    assert!(store.room_router(room_id).await.unwrap().is_none());
    assert!(kv.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_room_drops_room_keys() {
    let (store, kv) = store_with_kv(Duration::from_secs(3600));
    let room_id = Uuid::new_v4();
    let connection_id = Uuid::new_v4();

    store
        .put_peer(&peer_record(room_id, connection_id, "Alice"))
        .await
        .unwrap();
    store
        .set_room_router(room_id, Uuid::new_v4())
        .await
        .unwrap();

    store.cleanup_room(room_id).await.unwrap();
    assert!(store.room_router(room_id).await.unwrap().is_none());
    assert!(store.room_peers(room_id).await.unwrap().is_empty());
    // The peer's own record is untouched.
    assert!(kv
        .get(&format!("peer:{connection_id}"))
        .await
        .unwrap()
        .is_some());
}
