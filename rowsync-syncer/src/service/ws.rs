//! Websocket endpoint for the sync protocol.
//!
//! Each accepted upgrade becomes one [`SyncSocket`] actor. The actor bridges
//! the async [`SyncerRegistry`] world and the actix context: downstream
//! frames arrive over an unbounded channel added as a stream, upstream text
//! frames are parsed into [`UpstreamMessage`]s and dispatched back to the
//! registry.

use super::SyncerRegistry;
use crate::client::ConnectParams;
use actix::{
    fut::wrap_future, Actor, ActorContext, ActorFutureExt, AsyncContext, StreamHandler,
};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rowsync_core::models::{
    poke::{DownstreamMessage, UpstreamMessage},
    version::CvrVersion,
    ClientGroupId, ClientId,
};
use serde::Deserialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// How often heartbeat pings are sent.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long before lack of client response causes a timeout.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the base64url-encoded identity json (`{"userID": ...}`).
const IDENTITY_HEADER: &str = "x-sync-identity";

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "clientGroupID")]
    client_group_id: String,
    #[serde(rename = "clientID")]
    client_id: String,
    #[serde(rename = "baseCookie")]
    base_cookie: Option<String>,
    ts: i64,
    lmid: u64,
}

#[derive(Debug, Deserialize)]
pub(super) struct Identity {
    #[serde(rename = "userID")]
    pub(super) user_id: String,
}

/// Decodes the identity header; `None` is answered with 401.
pub(super) fn authenticate(req: &HttpRequest) -> Option<Identity> {
    req.headers()
        .get(IDENTITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| URL_SAFE_NO_PAD.decode(value).ok())
        .and_then(|raw| serde_json::from_slice::<Identity>(&raw).ok())
}

/// Upgrades a connect request, answering the control catalog: 400 for a
/// malformed request, 401 for a missing or undecodable identity, 410 for a
/// deleted client group; 405 comes from method routing.
pub(super) async fn sync_index(
    req: HttpRequest,
    stream: web::Payload,
    registry: web::Data<SyncerRegistry>,
) -> Result<HttpResponse, actix_web::Error> {
    let Some(identity) = authenticate(&req) else {
        return Ok(HttpResponse::Unauthorized().finish());
    };

    let query = match web::Query::<ConnectQuery>::from_query(req.query_string()) {
        Ok(query) => query.into_inner(),
        Err(err) => {
            debug!(%err, "malformed connect request");
            return Ok(HttpResponse::BadRequest().body("malformed connect request"));
        }
    };
    if registry.is_deleted(&query.client_group_id).await {
        return Ok(HttpResponse::Gone().body("client group deleted"));
    }
    let base_cookie = match &query.base_cookie {
        None => None,
        Some(raw) => match raw.parse::<CvrVersion>() {
            Ok(version) => Some(version),
            Err(_) => return Ok(HttpResponse::BadRequest().body("malformed baseCookie")),
        },
    };
    let Some(ts) = chrono::DateTime::from_timestamp_millis(query.ts).map(|dt| dt.naive_utc())
    else {
        return Ok(HttpResponse::BadRequest().body("malformed ts"));
    };
    debug!(user_id = identity.user_id, client_id = query.client_id, "sync upgrade");

    let actor = SyncSocket {
        registry: registry.into_inner(),
        group: query.client_group_id.clone(),
        client_id: query.client_id.clone(),
        params: ConnectParams {
            client_id: query.client_id,
            base_cookie,
            ts,
            lmid: query.lmid,
        },
        socket_id: None,
        heartbeat: Instant::now(),
    };
    ws::start(actor, &req, stream)
}

pub(super) struct SyncSocket {
    registry: Arc<SyncerRegistry>,
    group: ClientGroupId,
    client_id: ClientId,
    params: ConnectParams,
    socket_id: Option<Uuid>,
    heartbeat: Instant,
}

impl SyncSocket {
    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > CLIENT_TIMEOUT {
                warn!(client_id = %act.client_id, "websocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn dispatch_upstream(&self, message: UpstreamMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let registry = self.registry.clone();
        let group = self.group.clone();
        let client_id = self.client_id.clone();
        let now = chrono::Utc::now().naive_utc();
        ctx.spawn(wrap_future(async move {
            if let Err(err) = registry
                .change_desired_queries(&group, &client_id, message, now)
                .await
            {
                error!(%err, "desired query change failed");
            }
        }));
    }
}

impl Actor for SyncSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);

        let (tx, rx) = unbounded_channel();
        ctx.add_stream(UnboundedReceiverStream::new(rx));

        let registry = self.registry.clone();
        let group = self.group.clone();
        let params = self.params.clone();
        let connect = wrap_future::<_, Self>(async move {
            registry.connect(&group, params, tx).await
        })
        .map(|res, act, ctx| match res {
            Ok(socket_id) => act.socket_id = Some(socket_id),
            Err(err) => {
                let reason = match &err {
                    super::ServiceError::Client(client_err) => client_err.close_reason(),
                    super::ServiceError::GroupDeleted => "deleted",
                    _ => "internal error",
                };
                warn!(%err, reason, "connect refused");
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some(reason.to_owned()),
                }));
                ctx.stop();
            }
        });
        ctx.spawn(connect);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(socket_id) = self.socket_id {
            let registry = self.registry.clone();
            let group = self.group.clone();
            let client_id = self.client_id.clone();
            tokio::spawn(async move {
                registry
                    .disconnect(&group, &client_id, socket_id)
                    .await;
            });
        }
    }
}

/// Downstream frames flowing out to the client.
impl StreamHandler<DownstreamMessage> for SyncSocket {
    fn handle(&mut self, message: DownstreamMessage, ctx: &mut Self::Context) {
        match serde_json::to_string(&message) {
            Ok(encoded) => ctx.text(encoded),
            Err(err) => error!(%err, "dropping unserializable frame"),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // The handler dropped our sender: a newer socket took over.
        debug!(client_id = %self.client_id, "socket replaced, closing");
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some("socket replaced".to_owned()),
        }));
        ctx.stop();
    }
}

/// Frames arriving from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SyncSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<UpstreamMessage>(&text) {
                Ok(UpstreamMessage::Ping) => {
                    self.heartbeat = Instant::now();
                    if let Ok(encoded) = serde_json::to_string(&DownstreamMessage::Pong) {
                        ctx.text(encoded);
                    }
                }
                Ok(message) => self.dispatch_upstream(message, ctx),
                Err(err) => {
                    warn!(%err, "malformed upstream message");
                    ctx.close(Some(ws::CloseReason {
                        code: ws::CloseCode::Invalid,
                        description: Some("malformed message".to_owned()),
                    }));
                    ctx.stop();
                }
            },
            Ok(ws::Message::Close(reason)) => {
                debug!(client_id = %self.client_id, ?reason, "client closed");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}
