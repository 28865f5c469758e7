//! Room router registry
//!
//! One live router per room. Concurrent joins racing on a cold room are
//! collapsed onto a single in-flight creation future that every caller
//! awaits, so the engine only ever builds one router per room. A router
//! whose worker died is treated as absent and replaced on next use.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use parley_protocol::RtpCapabilities;

use crate::engine::{RouterHandle, wait_closed};
use crate::error::{MediaError, Result};
use crate::media::workers::WorkerPool;
use crate::session::SessionStore;

type RouterResult = std::result::Result<Arc<dyn RouterHandle>, Arc<MediaError>>;
type RouterFuture = Shared<BoxFuture<'static, RouterResult>>;

enum Flight {
    Existing(RouterFuture),
    Inserted(RouterFuture),
}

pub struct RouterRegistry {
    workers: Arc<WorkerPool>,
    store: SessionStore,
    routers: Arc<RwLock<HashMap<Uuid, Arc<dyn RouterHandle>>>>,
    in_flight: Mutex<HashMap<Uuid, RouterFuture>>,
}

impl RouterRegistry {
    pub fn new(workers: Arc<WorkerPool>, store: SessionStore) -> Self {
        Self {
            workers,
            store,
            routers: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Router for the room, creating it if the room is cold or its
    /// previous router is on a dead worker.
    pub async fn get_or_create_room(&self, room_id: Uuid) -> Result<Arc<dyn RouterHandle>> {
        if let Some(router) = self.get_router(room_id).await {
            return Ok(router);
        }
        // Drop a stale dead entry so the creation path starts clean.
        self.routers
            .write()
            .await
            .retain(|id, router| *id != room_id || !router.liveness().is_dead());

        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&room_id) {
                Some(fut) => Flight::Existing(fut.clone()),
                None => {
                    let fut = self.creation_future(room_id).boxed().shared();
                    in_flight.insert(room_id, fut.clone());
                    Flight::Inserted(fut)
                }
            }
        };

        // Only the caller that inserted the entry removes it, so a later
        // creation started after this one settles is never evicted.
        match flight {
            Flight::Existing(fut) => fut.await.map_err(MediaError::Shared),
            Flight::Inserted(fut) => {
                let result = fut.await;
                self.in_flight.lock().await.remove(&room_id);
                result.map_err(MediaError::Shared)
            }
        }
    }

    /// Live router for the room, if any.
    pub async fn get_router(&self, room_id: Uuid) -> Option<Arc<dyn RouterHandle>> {
        let routers = self.routers.read().await;
        routers
            .get(&room_id)
            .filter(|router| !router.liveness().is_dead())
            .cloned()
    }

    pub async fn get_rtp_capabilities(&self, room_id: Uuid) -> Result<RtpCapabilities> {
        self.get_router(room_id)
            .await
            .map(|router| router.rtp_capabilities())
            .ok_or_else(|| MediaError::NotFound(format!("room {room_id}")))
    }

    /// Close the room's router and drop its store keys. Idempotent.
    pub async fn close_room(&self, room_id: Uuid) -> Result<()> {
        let router = self.routers.write().await.remove(&room_id);
        if let Some(router) = router {
            router.close().await;
            tracing::info!("Closed router for room {room_id}");
        }
        self.store.cleanup_room(room_id).await?;
        Ok(())
    }

    fn creation_future(&self, room_id: Uuid) -> impl Future<Output = RouterResult> + Send + 'static {
        let workers = self.workers.clone();
        let store = self.store.clone();
        let routers = self.routers.clone();
        async move {
            match create_router_for_room(workers, store.clone(), routers, room_id).await {
                Ok(router) => Ok(router),
                Err(err) => {
                    tracing::error!("Router creation for room {room_id} failed: {err}");
                    if let Err(cleanup_err) = store.cleanup_room(room_id).await {
                        tracing::warn!(
                            "Could not clean up store keys for room {room_id}: {cleanup_err}"
                        );
                    }
                    Err(Arc::new(err))
                }
            }
        }
    }
}

async fn create_router_for_room(
    workers: Arc<WorkerPool>,
    store: SessionStore,
    routers: Arc<RwLock<HashMap<Uuid, Arc<dyn RouterHandle>>>>,
    room_id: Uuid,
) -> Result<Arc<dyn RouterHandle>> {
    // Another path may have installed a live router while this future
    // was queued.
    let existing = routers.read().await.get(&room_id).cloned();
    if let Some(router) = existing {
        if !router.liveness().is_dead() {
            return Ok(router);
        }
    }

    let worker = workers.get_worker().await?;
    let router = worker.create_router().await?;
    // The store write lands before the handle is published, so a failed
    // write leaves neither a registered router nor a live engine one.
    if let Err(err) = store.set_room_router(room_id, router.id()).await {
        router.close().await;
        return Err(err.into());
    }
    routers.write().await.insert(room_id, router.clone());
    tracing::info!("Created router {} for room {room_id}", router.id());

    let closed = router.on_closed();
    let router_id = router.id();
    let weak = Arc::downgrade(&routers);
    tokio::spawn(async move {
        wait_closed(closed).await;
        let Some(routers) = weak.upgrade() else {
            return;
        };
        let removed = {
            let mut map = routers.write().await;
            if map.get(&room_id).is_some_and(|r| r.id() == router_id) {
                map.remove(&room_id);
                true
            } else {
                false
            }
        };
        // Only the watcher that owned the registered entry drops the
        // store key, so a replacement router's record is never deleted.
        if removed {
            tracing::debug!("Deregistered closed router {router_id} for room {room_id}");
            if let Err(err) = store.clear_room_router(room_id).await {
                tracing::warn!("Could not drop router record for room {room_id}: {err}");
            }
        }
    });

    Ok(router)
}
