//! Syncer web service.
//!
//! One actix-web server exposes the websocket sync endpoint plus a health
//! probe. The [`SyncerRegistry`] behind it owns one [`ClientHandler`] per
//! client group, pins the lease epoch each group was connected at, and
//! funnels both configuration changes and query-driven updates through their
//! updaters so that one group never has two updates in flight.

mod ws;

use crate::{
    client::{ClientError, ClientHandler, ConnectParams, MutationLog, RowSource},
    poke::{into_frames, PokeAssembler},
    updater::{ConfigUpdater, QueryUpdater, ReceivedRow, UpdaterError},
};
use actix_web::{dev::ServerHandle, web, App, HttpRequest, HttpResponse, HttpServer};
use chrono::NaiveDateTime;
use rowsync_core::{
    cancel::CancellationFlag,
    ident::SchemaMap,
    models::{
        patch::PatchToVersion,
        poke::{DownstreamMessage, Poke, UpstreamMessage},
        version::StateVersion,
        ClientGroupId, ClientId, QueryHash, TransformationHash,
    },
    storage::{CvrStore, StorageError},
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// A stale snapshot is reloaded this many times before giving up.
const CONCURRENT_MODIFICATION_RETRIES: usize = 3;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Updater(#[from] UpdaterError),
    /// The client group was removed by delete-all; connects answer 410.
    #[error("client group deleted")]
    GroupDeleted,
    #[error("service error: {0}")]
    Server(String),
}

type OwnershipHook = Arc<dyn Fn(&ClientGroupId) + Send + Sync>;

/// One query-driven update as handed over by the IVM pipeline.
#[derive(Clone, Debug, Default)]
pub struct QueryUpdate {
    pub executed: Vec<(QueryHash, TransformationHash)>,
    pub removed: Vec<QueryHash>,
    pub rows: Vec<ReceivedRow>,
    pub last_mutation_id_changes: BTreeMap<ClientId, u64>,
}

/// Owns the per-group client handlers and runs all CVR updates.
pub struct SyncerRegistry {
    store: Arc<dyn CvrStore>,
    mutation_log: Arc<dyn MutationLog>,
    row_source: Arc<dyn RowSource>,
    schema: SchemaMap,
    task_id: String,
    handlers: Mutex<HashMap<ClientGroupId, Arc<ClientHandler>>>,
    /// Lease epoch per group: the latest connection time this process loaded
    /// the CVR at. All updates for the group reuse it, so a peer claiming a
    /// newer epoch fences every subsequent flush of ours.
    leases: Mutex<HashMap<ClientGroupId, NaiveDateTime>>,
    /// Groups removed by delete-all; their connects answer 410.
    deleted_groups: Mutex<HashSet<ClientGroupId>>,
    ownership_hook: Mutex<Option<OwnershipHook>>,
}

impl SyncerRegistry {
    pub fn new(
        store: Arc<dyn CvrStore>,
        mutation_log: Arc<dyn MutationLog>,
        row_source: Arc<dyn RowSource>,
        schema: SchemaMap,
        task_id: &str,
    ) -> Self {
        SyncerRegistry {
            store,
            mutation_log,
            row_source,
            schema,
            task_id: task_id.to_owned(),
            handlers: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            deleted_groups: Mutex::new(HashSet::new()),
            ownership_hook: Mutex::new(None),
        }
    }

    /// Registers the callback fired when another process takes a CVR away
    /// from us. Losing ownership is fatal to this syncer instance.
    pub async fn on_ownership_lost(&self, hook: OwnershipHook) {
        *self.ownership_hook.lock().await = Some(hook);
    }

    pub async fn handler(&self, group: &ClientGroupId) -> Arc<ClientHandler> {
        let mut handlers = self.handlers.lock().await;
        handlers
            .entry(group.clone())
            .or_insert_with(|| {
                Arc::new(ClientHandler::new(
                    group,
                    self.store.clone(),
                    self.mutation_log.clone(),
                    self.row_source.clone(),
                    self.schema.clone(),
                    &self.task_id,
                ))
            })
            .clone()
    }

    pub async fn connect(
        &self,
        group: &ClientGroupId,
        mut params: ConnectParams,
        sender: tokio::sync::mpsc::UnboundedSender<DownstreamMessage>,
    ) -> Result<Uuid, ServiceError> {
        if self.is_deleted(group).await {
            return Err(ServiceError::GroupDeleted);
        }
        params.ts = self.advance_lease(group, params.ts).await;
        let handler = self.handler(group).await;
        let (socket_id, _) = handler.connect(params, sender).await?;
        Ok(socket_id)
    }

    pub async fn disconnect(&self, group: &ClientGroupId, client_id: &ClientId, socket_id: Uuid) {
        let handler = { self.handlers.lock().await.get(group).cloned() };
        if let Some(handler) = handler {
            handler.disconnect(client_id, socket_id).await;
        }
    }

    pub async fn is_deleted(&self, group: &ClientGroupId) -> bool {
        self.deleted_groups.lock().await.contains(group)
    }

    /// Delete-all for one client group: purges the CVR, drops the handler
    /// (which closes every socket) and marks the group so later connects
    /// answer 410.
    #[instrument(skip(self), fields(client_group = %group))]
    pub async fn delete_client_group(&self, group: &ClientGroupId) -> Result<(), ServiceError> {
        self.deleted_groups.lock().await.insert(group.clone());
        self.handlers.lock().await.remove(group);
        self.leases.lock().await.remove(group);
        self.store
            .purge(group)
            .await
            .map_err(UpdaterError::from)?;
        info!("client group deleted");
        Ok(())
    }

    /// Applies one client's desired-query change and pokes the whole group
    /// from the pre-update version to the new one.
    #[instrument(skip(self, change), fields(client_group = %group, client_id = %client_id))]
    pub async fn change_desired_queries(
        &self,
        group: &ClientGroupId,
        client_id: &ClientId,
        change: UpstreamMessage,
        now: NaiveDateTime,
    ) -> Result<(), ServiceError> {
        let lease = self.lease_epoch(group, now).await;
        for attempt in 0.. {
            let snapshot = match self.store.load(group, &self.task_id, lease).await {
                Ok(snapshot) => snapshot,
                Err(err) => return Err(self.fail(group, err).await),
            };
            let base = snapshot.cvr.version.clone();

            let mut updater = ConfigUpdater::new(self.store.clone(), snapshot);
            let patches = match &change {
                UpstreamMessage::PutDesiredQueries { queries } => {
                    updater.put_desired_queries(client_id, queries)
                }
                UpstreamMessage::DelDesiredQueries { hashes } => {
                    updater.delete_desired_queries(client_id, hashes)
                }
                UpstreamMessage::ClearDesiredQueries => updater.clear_desired_queries(client_id),
                UpstreamMessage::Ping => return Ok(()),
            };
            if patches.is_empty() {
                return Ok(());
            }
            match updater.flush(now).await {
                Ok((cvr, _)) => {
                    self.poke_group(group, Some(&base), &cvr.version, &patches, BTreeMap::new())
                        .await?;
                    return Ok(());
                }
                Err(UpdaterError::Storage(StorageError::ConcurrentModification { .. }))
                    if attempt + 1 < CONCURRENT_MODIFICATION_RETRIES =>
                {
                    warn!(attempt, "stale cvr snapshot, reloading");
                    continue;
                }
                Err(UpdaterError::Storage(err)) => return Err(self.fail(group, err).await),
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("retry loop always returns");
    }

    /// Applies one query-driven update from the IVM pipeline: track executed
    /// and removed queries, fold in row deltas, tombstone drained rows, flush
    /// and poke the group.
    #[instrument(skip(self, update), fields(client_group = %group, rows = update.rows.len()))]
    pub async fn apply_query_update(
        &self,
        group: &ClientGroupId,
        state_version: StateVersion,
        replica_version: &str,
        update: QueryUpdate,
        now: NaiveDateTime,
    ) -> Result<(), ServiceError> {
        let lease = self.lease_epoch(group, now).await;
        for attempt in 0.. {
            let snapshot = match self.store.load(group, &self.task_id, lease).await {
                Ok(snapshot) => snapshot,
                Err(err) => return Err(self.fail(group, err).await),
            };
            let base = snapshot.cvr.version.clone();

            let mut updater = QueryUpdater::new(
                self.store.clone(),
                snapshot,
                state_version.clone(),
                replica_version,
                CancellationFlag::new(),
            )?;
            let (_, mut patches) = updater.track_queries(&update.executed, &update.removed)?;
            patches.extend(updater.received(update.rows.clone()).await?);
            patches.extend(updater.delete_unreferenced_rows().await?);

            if patches.is_empty() && update.last_mutation_id_changes.is_empty() {
                return Ok(());
            }
            match updater.flush(now).await {
                Ok((cvr, _)) => {
                    self.poke_group(
                        group,
                        Some(&base),
                        &cvr.version,
                        &patches,
                        update.last_mutation_id_changes.clone(),
                    )
                    .await?;
                    return Ok(());
                }
                Err(UpdaterError::Storage(StorageError::ConcurrentModification { .. }))
                    if attempt + 1 < CONCURRENT_MODIFICATION_RETRIES =>
                {
                    warn!(attempt, "stale cvr snapshot, reloading");
                    continue;
                }
                Err(UpdaterError::Storage(err)) => return Err(self.fail(group, err).await),
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("retry loop always returns");
    }

    async fn poke_group(
        &self,
        group: &ClientGroupId,
        base: Option<&rowsync_core::models::version::CvrVersion>,
        cookie: &rowsync_core::models::version::CvrVersion,
        patches: &[PatchToVersion],
        last_mutation_id_changes: BTreeMap<ClientId, u64>,
    ) -> Result<(), ServiceError> {
        let assembler = PokeAssembler::new(&self.schema);
        let poke = assembler
            .assemble(base, cookie, patches, last_mutation_id_changes)
            .map_err(ClientError::from)?;
        self.handler(group)
            .await
            .broadcast(&frames(poke))
            .await;
        Ok(())
    }

    /// Advances the group's lease epoch; only client connections move it
    /// forward, claiming the CVR away from older holders.
    async fn advance_lease(&self, group: &ClientGroupId, at: NaiveDateTime) -> NaiveDateTime {
        let mut leases = self.leases.lock().await;
        let epoch = leases.entry(group.clone()).or_insert(at);
        if *epoch < at {
            *epoch = at;
        }
        *epoch
    }

    /// The pinned epoch for internal updates. Deliberately does not advance:
    /// an update must fail, not silently reclaim, once a peer holds a newer
    /// lease.
    async fn lease_epoch(&self, group: &ClientGroupId, fallback: NaiveDateTime) -> NaiveDateTime {
        let mut leases = self.leases.lock().await;
        *leases.entry(group.clone()).or_insert(fallback)
    }

    /// Ownership losses fire the registered hook; everything else passes
    /// through unchanged.
    async fn fail(&self, group: &ClientGroupId, err: StorageError) -> ServiceError {
        if matches!(err, StorageError::Ownership { .. }) {
            warn!(client_group = %group, %err, "cvr ownership lost");
            if let Some(hook) = self.ownership_hook.lock().await.as_ref() {
                hook(group);
            }
        }
        ServiceError::Updater(err.into())
    }
}

fn frames(poke: Poke) -> Vec<DownstreamMessage> {
    let (start, parts, end) = into_frames(poke);
    let mut frames = vec![DownstreamMessage::PokeStart(start)];
    frames.extend(parts.into_iter().map(DownstreamMessage::PokePart));
    frames.push(DownstreamMessage::PokeEnd(end));
    frames
}

pub struct ServicesBuilder {
    prefix: String,
    port: u16,
    bind: String,
    registry: Arc<SyncerRegistry>,
}

impl ServicesBuilder {
    pub fn new(registry: Arc<SyncerRegistry>) -> Self {
        Self { prefix: "v1".to_owned(), port: 4848, bind: "0.0.0.0".to_owned(), registry }
    }

    pub fn prefix(mut self, v: &str) -> Self {
        self.prefix = v.to_owned();
        self
    }

    pub fn bind(mut self, v: &str) -> Self {
        self.bind = v.to_owned();
        self
    }

    pub fn port(mut self, v: u16) -> Self {
        self.port = v;
        self
    }

    pub fn run(self) -> Result<(ServerHandle, JoinHandle<Result<(), ServiceError>>), ServiceError> {
        let registry = web::Data::from(self.registry);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(registry.clone())
                .service(
                    web::resource(format!("/{}/sync", self.prefix))
                        .route(web::get().to(ws::sync_index)),
                )
                .service(
                    web::resource(format!("/{}/groups/{{client_group_id}}/delete", self.prefix))
                        .route(web::post().to(delete_group)),
                )
                .service(
                    web::resource(format!("/{}/healthz", self.prefix))
                        .route(web::get().to(healthz)),
                )
        })
        .bind((self.bind, self.port))
        .map_err(|err| ServiceError::Server(err.to_string()))?
        .run();
        let handle = server.handle();
        let server = async move {
            info!("syncer service started");
            let res = server.await;
            res.map_err(|err| ServiceError::Server(err.to_string()))
        };
        let task = tokio::spawn(server);
        Ok((handle, task))
    }
}

async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Delete-all configuration endpoint; answers 200 on success, 401 without a
/// valid identity, 405 for anything but POST (method routing).
async fn delete_group(
    req: HttpRequest,
    path: web::Path<String>,
    registry: web::Data<SyncerRegistry>,
) -> HttpResponse {
    if ws::authenticate(&req).is_none() {
        return HttpResponse::Unauthorized().finish();
    }
    let group = path.into_inner();
    match registry.delete_client_group(&group).await {
        Ok(()) => HttpResponse::Ok().body("OK"),
        Err(err) => {
            error!(client_group = %group, %err, "delete-all failed");
            HttpResponse::InternalServerError().finish()
        }
    }
}
