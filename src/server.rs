use std::sync::Arc;
use std::time::UNIX_EPOCH;

use futures::{select, SinkExt, StreamExt};

use futures_timer::Delay;

use log::{debug, info, warn};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::api::*;
use crate::config::Config;
use crate::constants::STATUS_INTERVAL;
use crate::error::Error;
use crate::labels::LabelStore;
use crate::router::{Router, RouterEvent};
use crate::salvo::{Salvo, SalvoStore};

struct Shared {
    router: Router,
    labels: LabelStore,
    salvos: SalvoStore,
    events: broadcast::Sender<ServerEvent>,
    connection_type: String,
    allowed_origin: String,
    listen: String,
}

/// The fan-out: multiplexes many WebSocket clients onto the one router
/// session, broadcasts tally deltas to subscribers, and serves queries
/// from the cache.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: &Config, router: Router) -> Server {
        let (events, _) = broadcast::channel(256);
        Server {
            shared: Arc::new(Shared {
                router,
                labels: LabelStore::new(),
                salvos: SalvoStore::new(),
                events,
                connection_type: config.transport_config().kind().to_owned(),
                allowed_origin: config.client_allowed_origin.clone(),
                listen: config.listen_addr(),
            }),
        }
    }

    /// Bind the configured listen address and serve forever.
    pub async fn run(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.shared.listen).await?;
        self.serve(listener).await
    }

    /// Serve clients from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        info!("Fan-out listening on {}", listener.local_addr()?);
        self.spawn_router_forwarder();
        self.spawn_status_timer();

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Client connected from {}", peer);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(shared, stream).await {
                    debug!("Client {} ended: {}", peer, e);
                }
            });
        }
    }

    /// Relays session events onto the client broadcast channel.
    fn spawn_router_forwarder(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut events = shared.router.events();
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let _ = shared.events.send(translate(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Fan-out lagged {} router events", skipped)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_status_timer(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                Delay::new(STATUS_INTERVAL).await;
                let _ = shared.events.send(ServerEvent::StatusUpdate {
                    status: status_of(&shared),
                });
            }
        });
    }
}

fn translate(event: RouterEvent) -> ServerEvent {
    match event {
        RouterEvent::CrosspointChange(crosspoint) => ServerEvent::CrosspointChange { crosspoint },
        RouterEvent::Connected => ServerEvent::RouterConnected,
        RouterEvent::Disconnected => ServerEvent::RouterDisconnected,
        RouterEvent::Error(e) => ServerEvent::RouterError {
            message: e.to_string(),
        },
    }
}

fn status_of(shared: &Shared) -> Status {
    Status {
        connected: shared.router.is_connected(),
        connection_type: shared.connection_type.clone(),
        crosspoint_count: shared.router.crosspoint_count(),
        last_update: shared.router.last_update().map(|t| {
            t.duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64
        }),
    }
}

async fn serve_client(shared: Arc<Shared>, stream: TcpStream) -> Result<(), WsError> {
    let allowed = shared.allowed_origin.clone();
    let check_origin = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        // Non-browser clients send no Origin header and are let through;
        // the fan-out trusts its LAN.
        match req.headers().get("origin") {
            Some(origin) if !allowed.is_empty() && origin.to_str().ok() != Some(&allowed) => {
                debug!("Rejecting client with origin {:?}", origin);
                let mut resp = ErrorResponse::new(Some("origin not allowed".to_owned()));
                *resp.status_mut() = StatusCode::FORBIDDEN;
                Err(resp)
            }
            _ => Ok(resp),
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, check_origin).await?;
    let (mut sink, stream) = ws.split();
    let mut stream = stream.fuse();
    let mut events = BroadcastStream::new(shared.events.subscribe()).fuse();
    let mut subscribed = false;

    loop {
        select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(reply) = handle_request(&shared, &text, &mut subscribed) {
                        send_json(&mut sink, &reply).await?;
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => sink.send(WsMessage::Pong(payload)).await?,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {} // Binary and friends are not part of the protocol.
                Some(Err(e)) => {
                    debug!("Client read error: {}", e);
                    break;
                }
            },
            event = events.next() => match event {
                Some(Ok(event)) => {
                    if subscribed {
                        send_json(&mut sink, &ServerEnvelope::broadcast(event)).await?;
                    }
                }
                Some(Err(e)) => warn!("Client fell behind the broadcast stream: {}", e),
                None => break,
            },
        }
    }

    Ok(())
}

async fn send_json<S>(sink: &mut S, envelope: &ServerEnvelope) -> Result<(), WsError>
where
    S: futures::Sink<WsMessage, Error = WsError> + Unpin,
{
    match serde_json::to_string(envelope) {
        Ok(json) => sink.send(WsMessage::Text(json)).await,
        Err(e) => {
            warn!("Unserializable event: {}", e);
            Ok(())
        }
    }
}

fn handle_request(shared: &Shared, text: &str, subscribed: &mut bool) -> Option<ServerEnvelope> {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Unknown events are ignored without disconnecting the client.
            debug!("Ignoring unintelligible client message: {}", e);
            return None;
        }
    };
    let id = envelope.id;

    let reply = match envelope.request {
        ClientRequest::Subscribe => {
            *subscribed = true;
            ServerEvent::Ack
        }
        ClientRequest::Unsubscribe => {
            *subscribed = false;
            ServerEvent::Ack
        }
        ClientRequest::TakeCrosspoint {
            matrix,
            level,
            destination,
            source,
        } => ack_or_error(shared.router.take(matrix, level, destination, source)),
        ClientRequest::TakeMultiLevel {
            matrix,
            levels,
            destination,
            source,
        } => ack_or_error(shared.router.take_multi(matrix, &levels, destination, source)),
        ClientRequest::QueryCrosspoint {
            matrix,
            level,
            destination,
        } => ServerEvent::Crosspoint {
            crosspoint: shared.router.get(matrix, level, destination),
        },
        ClientRequest::SetLabel { key, value } => {
            shared.labels.set(key, value.clone());
            let _ = shared.events.send(ServerEvent::LabelChange { key, value });
            ServerEvent::Ack
        }
        ClientRequest::GetLabel { key } => ServerEvent::Label {
            key,
            value: shared.labels.get(&key),
        },
        ClientRequest::GetAllLabels => ServerEvent::Labels {
            labels: shared
                .labels
                .all()
                .into_iter()
                .map(|(key, value)| LabelRecord { key, value })
                .collect(),
        },
        ClientRequest::CreateSalvo {
            salvo,
            name,
            crosspoints,
        } => {
            let salvo = Salvo {
                id: salvo,
                name,
                crosspoints,
            };
            shared.salvos.insert(salvo.clone());
            let _ = shared.events.send(ServerEvent::SalvoChange { salvo });
            ServerEvent::Ack
        }
        ClientRequest::ExecuteSalvo { salvo } => match shared.salvos.get(salvo) {
            Some(salvo) => {
                // Done once every take is enqueued; the tallies follow as
                // ordinary crosspoint-change broadcasts.
                let mut first_error = None;
                for xp in &salvo.crosspoints {
                    if let Err(e) = shared.router.take(0, xp.level, xp.destination, xp.source) {
                        first_error.get_or_insert(e);
                    }
                }
                match first_error {
                    None => ServerEvent::Ack,
                    Some(e) => ServerEvent::RouterError {
                        message: e.to_string(),
                    },
                }
            }
            None => ServerEvent::RouterError {
                message: Error::UnknownSalvo(salvo).to_string(),
            },
        },
        ClientRequest::GetAllSalvos => ServerEvent::Salvos {
            salvos: shared.salvos.all(),
        },
        ClientRequest::GetStatus => ServerEvent::StatusUpdate {
            status: status_of(shared),
        },
        ClientRequest::GetAllCrosspoints => ServerEvent::CrosspointUpdate {
            crosspoints: shared.router.get_all(),
        },
        ClientRequest::GetCrosspointsByLevel { matrix, level } => ServerEvent::CrosspointUpdate {
            crosspoints: shared.router.get_by_level(matrix, level),
        },
    };

    Some(ServerEnvelope::reply(reply, id))
}

fn ack_or_error(result: Result<(), Error>) -> ServerEvent {
    match result {
        Ok(()) => ServerEvent::Ack,
        Err(e) => ServerEvent::RouterError {
            message: e.to_string(),
        },
    }
}
