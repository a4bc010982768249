//! Per-client connection handling: connect validation, socket registry and
//! catch-up replay.
//!
//! The handler owns the sockets of one client group. Everything it needs
//! beyond the CVR itself is reached through two collaborator traits: the
//! [`MutationLog`] (authoritative last-mutation-ids, maintained by the
//! replication ingester) and the [`RowSource`] (row contents from the replica;
//! the CVR stores only versions and refcounts).

use crate::poke::{into_frames, PokeAssembler};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::StreamExt;
use metrics::counter;
use rowsync_core::{
    ident::SchemaMap,
    models::{
        cvr::RowId,
        patch::{PatchToVersion, RowPatch},
        poke::{DownstreamMessage, ProtocolError},
        version::CvrVersion,
        ClientGroupId, ClientId, QueryHash,
    },
    storage::{CvrSnapshot, CvrStore, StorageError},
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::{mpsc::UnboundedSender, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ClientError {
    /// Reason string carried in the close frame sent to the client.
    pub fn close_reason(&self) -> &'static str {
        match self {
            ClientError::Protocol(ProtocolError::UnexpectedLmid { .. }) => "unexpected lmid",
            ClientError::Protocol(ProtocolError::UnexpectedBaseCookie(_)) => {
                "unexpected baseCookie"
            }
            ClientError::Protocol(_) => "protocol error",
            ClientError::Storage(StorageError::Ownership { .. }) => "moved",
            ClientError::Storage(_) => "internal error",
        }
    }
}

/// Authoritative last-mutation-id lookups, owned by the replication side.
#[async_trait]
pub trait MutationLog: Send + Sync {
    async fn last_mutation_id(
        &self,
        client_group: &ClientGroupId,
        client: &ClientId,
    ) -> Result<Option<u64>, StorageError>;
}

/// Row contents lookups against the replica, for catch-up puts.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch(&self, ids: &[RowId]) -> Result<Vec<(RowId, String, Value)>, StorageError>;
}

/// Fields of a connect request, already parsed from the URL query.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectParams {
    pub client_id: ClientId,
    pub base_cookie: Option<CvrVersion>,
    pub ts: NaiveDateTime,
    pub lmid: u64,
}

struct ClientSocket {
    socket_id: Uuid,
    sender: UnboundedSender<DownstreamMessage>,
}

/// Connection-facing half of one client group's syncer.
pub struct ClientHandler {
    group: ClientGroupId,
    store: Arc<dyn CvrStore>,
    mutation_log: Arc<dyn MutationLog>,
    row_source: Arc<dyn RowSource>,
    schema: SchemaMap,
    task_id: String,
    sockets: Mutex<HashMap<ClientId, ClientSocket>>,
}

impl ClientHandler {
    pub fn new(
        group: &ClientGroupId,
        store: Arc<dyn CvrStore>,
        mutation_log: Arc<dyn MutationLog>,
        row_source: Arc<dyn RowSource>,
        schema: SchemaMap,
        task_id: &str,
    ) -> Self {
        ClientHandler {
            group: group.clone(),
            store,
            mutation_log,
            row_source,
            schema,
            task_id: task_id.to_owned(),
            sockets: Mutex::new(HashMap::new()),
        }
    }

    /// Handles a fresh connection: loads the CVR (claiming the lease),
    /// validates the request against it, registers the socket (replacing and
    /// thereby closing any previous one for the same client) and replays
    /// catch-up. The `connected` frame precedes everything else.
    ///
    /// Returns the socket id; [`ClientHandler::disconnect`] with the same id
    /// clears the registration unless a newer socket took over.
    #[instrument(skip(self, sender), fields(client_group = %self.group, client_id = %params.client_id))]
    pub async fn connect(
        &self,
        params: ConnectParams,
        sender: UnboundedSender<DownstreamMessage>,
    ) -> Result<(Uuid, CvrSnapshot), ClientError> {
        let snapshot = self
            .store
            .load(&self.group, &self.task_id, params.ts)
            .await?;
        self.validate(&params, &snapshot).await?;

        let socket_id = Uuid::new_v4();
        {
            let mut sockets = self.sockets.lock().await;
            if let Some(previous) = sockets.insert(
                params.client_id.clone(),
                ClientSocket { socket_id, sender: sender.clone() },
            ) {
                // Dropping the previous sender ends its receive loop; the
                // transport closes the stale socket.
                debug!(socket_id = %previous.socket_id, "replacing previous socket");
            }
        }
        counter!("rowsync_client_connects_total").increment(1);

        let _ = sender.send(DownstreamMessage::Connected { client_id: params.client_id.clone() });
        self.catchup(&params, &snapshot, &sender).await?;
        info!(version = %snapshot.cvr.version, "client connected");
        Ok((socket_id, snapshot))
    }

    /// Clears transient socket state. CVR entries persist; a reconnect will
    /// replay from the client's cookie.
    pub async fn disconnect(&self, client_id: &ClientId, socket_id: Uuid) {
        let mut sockets = self.sockets.lock().await;
        if sockets
            .get(client_id)
            .map(|socket| socket.socket_id == socket_id)
            .unwrap_or(false)
        {
            sockets.remove(client_id);
            debug!(client_group = %self.group, client_id, "client disconnected");
        }
    }

    /// Fans a poke's frames out to every registered socket. Senders whose
    /// receiving side is gone are pruned.
    pub async fn broadcast(&self, frames: &[DownstreamMessage]) {
        let mut sockets = self.sockets.lock().await;
        sockets.retain(|client_id, socket| {
            for frame in frames {
                if socket.sender.send(frame.clone()).is_err() {
                    debug!(client_id, "dropping closed socket");
                    return false;
                }
            }
            true
        });
    }

    pub async fn connected_clients(&self) -> Vec<ClientId> {
        self.sockets.lock().await.keys().cloned().collect()
    }

    async fn validate(
        &self,
        params: &ConnectParams,
        snapshot: &CvrSnapshot,
    ) -> Result<(), ClientError> {
        let recorded = self
            .mutation_log
            .last_mutation_id(&self.group, &params.client_id)
            .await?
            .unwrap_or(0);
        if params.lmid > recorded {
            // The client claims mutations we have no record of; the client
            // group was most likely recreated underneath it.
            warn!(claimed = params.lmid, recorded, "unexpected lmid");
            return Err(ProtocolError::UnexpectedLmid { claimed: params.lmid, recorded }.into());
        }
        if let Some(base_cookie) = &params.base_cookie {
            if *base_cookie > snapshot.cvr.version {
                warn!(%base_cookie, version = %snapshot.cvr.version, "unexpected baseCookie");
                return Err(ProtocolError::UnexpectedBaseCookie(format!(
                    "client at {base_cookie}, cvr at {}",
                    snapshot.cvr.version
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Streams everything the client missed between its base cookie and the
    /// current CVR version: configuration patches first, then row patches,
    /// excluding rows whose only references are in queries that are about to
    /// hydrate anyway (desired but not yet got).
    async fn catchup(
        &self,
        params: &ConnectParams,
        snapshot: &CvrSnapshot,
        sender: &UnboundedSender<DownstreamMessage>,
    ) -> Result<(), ClientError> {
        let after = params
            .base_cookie
            .clone()
            .unwrap_or_else(CvrVersion::min);
        let current = snapshot.cvr.version.clone();
        if after == current {
            return Ok(());
        }

        let mut patches: Vec<PatchToVersion> = Vec::new();
        let mut config_stream = self
            .store
            .catchup_config_patches(&self.group, &after, &current)
            .await?;
        while let Some(patch) = config_stream.next().await {
            patches.push(patch?);
        }

        let hydrating: Vec<QueryHash> = snapshot
            .cvr
            .queries
            .values()
            .filter(|q| !q.deleted && q.is_desired() && !q.is_got())
            .map(|q| q.hash.clone())
            .collect();
        let mut row_stream = self
            .store
            .catchup_row_patches(&self.group, &after, &current, &hydrating)
            .await?;
        while let Some(batch) = row_stream.next().await {
            let batch = batch?;
            let live_ids: Vec<RowId> = batch
                .iter()
                .filter(|record| !record.is_tombstone())
                .map(|record| record.id.clone())
                .collect();
            let mut contents: HashMap<RowId, (String, Value)> = self
                .row_source
                .fetch(&live_ids)
                .await?
                .into_iter()
                .map(|(id, version, value)| (id, (version, value)))
                .collect();
            for record in batch {
                let patch = if record.is_tombstone() {
                    RowPatch::Del { id: record.id.clone() }
                } else {
                    let Some((row_version, value)) = contents.remove(&record.id) else {
                        // The replica no longer has the row; the next
                        // query-driven update will tombstone it.
                        continue;
                    };
                    RowPatch::Put { id: record.id.clone(), row_version, contents: value }
                };
                patches.push(PatchToVersion::row(record.patch_version.clone(), patch));
            }
        }

        let assembler = PokeAssembler::new(&self.schema);
        let poke = assembler
            .assemble(params.base_cookie.as_ref(), &current, &patches, Default::default())
            .map_err(ClientError::from)?;
        let (start, parts, end) = into_frames(poke);
        let _ = sender.send(DownstreamMessage::PokeStart(start));
        for part in parts {
            let _ = sender.send(DownstreamMessage::PokePart(part));
        }
        let _ = sender.send(DownstreamMessage::PokeEnd(end));
        Ok(())
    }
}
