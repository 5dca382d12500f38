//! Broadcast fabric and websocket surface
//!
//! Every connected client gets a session task pair: a writer draining a
//! bounded per-session outbound queue (with heartbeat pings), and a
//! broadcaster feeding that queue from the engine's event channel. Ticks are
//! dropped for a slow session; terminal frames are delivered reliably, and a
//! lagged consumer resyncs from the engine's latest-frame snapshot.
//!
//! Handshake authentication accepts a token in the `token` query parameter,
//! an `Authorization: Bearer` header, or a `bearer.<token>` subprotocol.
//! Anonymous callers get a guest session with a virtual balance.

pub mod frames;
pub mod registry;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::rate_limit::TokenBucket;
use crate::api::AppContext;
use crate::engine::EngineEvent;
use crate::errors::Error;
use crate::money::{Money, Multiplier};
use crate::store::models::Role;

use self::frames::{ClientMessage, ServerMessage};
use self::registry::SessionKey;

const OUTBOUND_QUEUE: usize = 64;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Two missed heartbeats terminate the socket.
const PONG_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws
pub async fn ws_handler(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let (token, subprotocol) = extract_token(&headers, query.token);

    // Optional auth: a bad token downgrades to guest rather than refusing
    // the socket; the client sees `authenticated: false` and can re-attach.
    let identity = token
        .as_deref()
        .and_then(|t| ctx.creds.validate_access(t).ok());

    let ws = match subprotocol {
        Some(proto) => ws.protocols([proto]),
        None => ws,
    };

    ws.on_upgrade(move |socket| handle_socket(ctx, socket, identity))
}

/// Token lookup order: query parameter, Authorization header, subprotocol.
/// Returns the subprotocol string to echo back when that path was used.
fn extract_token(
    headers: &HeaderMap,
    query_token: Option<String>,
) -> (Option<String>, Option<String>) {
    if let Some(token) = query_token {
        return (Some(token), None);
    }

    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return (Some(auth.to_string()), None);
    }

    if let Some(protocols) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        for proto in protocols.split(',').map(str::trim) {
            if let Some(token) = proto.strip_prefix("bearer.") {
                return (Some(token.to_string()), Some(proto.to_string()));
            }
        }
    }

    (None, None)
}

async fn handle_socket(
    ctx: AppContext,
    socket: WebSocket,
    identity: Option<crate::auth::Identity>,
) {
    // Resolve the session identity and starting balance.
    let (key, role, balance, authenticated) = match identity {
        Some(id) => {
            let store = Arc::clone(&ctx.store);
            let uid = id.user_id;
            let user = tokio::task::spawn_blocking(move || store.find_user(uid)).await;
            match user {
                Ok(Ok(user)) if user.is_active => {
                    (SessionKey::User(id.user_id), id.role, user.balance, true)
                }
                _ => {
                    warn!(user_id = id.user_id, "rejecting socket for unknown or inactive user");
                    return;
                }
            }
        }
        None => (
            SessionKey::Guest(Uuid::new_v4()),
            Role::Player,
            ctx.config.game.default_balance_money(),
            false,
        ),
    };

    let attachment = ctx.registry.attach(key, role, balance);
    let conn_id = attachment.conn_id;
    let mut killed = attachment.killed;
    info!(?key, conn_id, authenticated, players = ctx.registry.count(), "session attached");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    // Heartbeat bookkeeping shared between reader and writer.
    let started = Instant::now();
    let last_pong = Arc::new(AtomicU64::new(0));

    // Handshake ack plus the current public frame so a client never waits a
    // full tick to learn the game state.
    let hello = ServerMessage::Connected {
        authenticated,
        balance: balance.to_f64(),
    };
    queue_json(&out_tx, &hello).await;
    let latest = ctx.engine.latest_frame();
    if !latest.is_empty() {
        let _ = out_tx.send(Message::Text(latest.to_string())).await;
    }

    // Writer: drains the outbound queue, pings on schedule, enforces pong
    // deadlines.
    let writer = {
        let last_pong = Arc::clone(&last_pong);
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    maybe = out_rx.recv() => match maybe {
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = heartbeat.tick() => {
                        let elapsed = started.elapsed().as_millis() as u64;
                        let pong_age = elapsed.saturating_sub(last_pong.load(Ordering::Relaxed));
                        if pong_age > PONG_TIMEOUT_MS {
                            debug!("pong deadline missed, closing socket");
                            break;
                        }
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    // Broadcaster: engine events into the outbound queue. Ticks use
    // `try_send` (drop on a full buffer); terminal frames and personal acks
    // wait for space.
    let broadcaster = {
        let out_tx = out_tx.clone();
        let registry = Arc::clone(&ctx.registry);
        let engine = ctx.engine.clone();
        tokio::spawn(async move {
            let mut events = engine.subscribe();
            loop {
                match events.recv().await {
                    Ok(EngineEvent::State {
                        public_json,
                        overlays,
                        terminal,
                    }) => {
                        let public = Message::Text(public_json.to_string());
                        let delivered = if terminal {
                            out_tx.send(public).await.is_ok()
                        } else {
                            out_tx.try_send(public).is_ok()
                        };
                        if !delivered && terminal {
                            break;
                        }

                        let wager = overlays.get(&key);
                        let overlay = ServerMessage::PlayerOverlay {
                            has_wager: wager.is_some(),
                            wager_amount: wager.map(|w| w.amount.to_f64()),
                            cashed_out: wager.map(|w| w.cashed_out.is_some()).unwrap_or(false),
                            cashout_multiplier: wager
                                .and_then(|w| w.cashed_out)
                                .map(|m| m.to_f64()),
                            balance: registry
                                .balance(key)
                                .unwrap_or(Money::ZERO)
                                .to_f64(),
                            authenticated,
                        };
                        if let Ok(json) = serde_json::to_string(&overlay) {
                            let message = Message::Text(json);
                            if terminal {
                                if out_tx.send(message).await.is_err() {
                                    break;
                                }
                            } else {
                                let _ = out_tx.try_send(message);
                            }
                        }
                    }
                    Ok(EngineEvent::AutoCashout { session, ack }) if session == key => {
                        let message = ServerMessage::CashedOut {
                            multiplier: ack.multiplier.to_f64(),
                            payout: ack.payout.to_f64(),
                            balance: ack.balance.to_f64(),
                        };
                        if let Ok(json) = serde_json::to_string(&message) {
                            if out_tx.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(EngineEvent::AutoCashout { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Resync from the snapshot instead of replaying.
                        debug!(skipped, "session lagged, resyncing from snapshot");
                        let latest = engine.latest_frame();
                        if !latest.is_empty() {
                            let _ = out_tx.try_send(Message::Text(latest.to_string()));
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // Reader: this task. Applies the inbound rate cap, validates, and
    // forwards actions to the engine.
    let inbound_rate = ctx.config.limits.ws_inbound_per_sec as f64;
    let mut inbound = TokenBucket::new(inbound_rate, inbound_rate);
    let mut limit_notified = false;

    loop {
        tokio::select! {
            changed = killed.changed() => {
                if changed.is_err() || *killed.borrow() {
                    let notice = ServerMessage::Warning {
                        message: "signed in from another connection".to_string(),
                    };
                    queue_json(&out_tx, &notice).await;
                    break;
                }
            }
            maybe = stream.next() => match maybe {
                Some(Ok(Message::Text(text))) => {
                    if !inbound.try_consume() {
                        // One notice per throttled window, then silence.
                        if !limit_notified {
                            limit_notified = true;
                            let notice = ServerMessage::Warning {
                                message: "too many messages, slow down".to_string(),
                            };
                            let _ = out_tx.try_send(Message::Text(
                                serde_json::to_string(&notice).unwrap_or_default(),
                            ));
                        }
                        continue;
                    }
                    limit_notified = false;

                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => {
                            handle_client_message(&ctx, key, authenticated, &out_tx, message)
                                .await;
                        }
                        Err(e) => {
                            let err = Error::from(e);
                            queue_json(&out_tx, &ServerMessage::error(&err)).await;
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    last_pong.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = out_tx.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "socket error");
                    break;
                }
            },
        }
    }

    writer.abort();
    broadcaster.abort();
    ctx.registry.detach(key, conn_id);
    info!(?key, conn_id, players = ctx.registry.count(), "session detached");
}

/// Validate and execute one inbound action, acknowledging on this socket.
async fn handle_client_message(
    ctx: &AppContext,
    key: SessionKey,
    authenticated: bool,
    out_tx: &mpsc::Sender<Message>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Bet {
            amount,
            auto_cashout,
        } => {
            let parsed = Money::parse_amount(amount).and_then(|stake| {
                let auto = auto_cashout.map(Multiplier::parse).transpose()?;
                Ok((stake, auto))
            });
            let (stake, auto) = match parsed {
                Ok(values) => values,
                Err(e) => {
                    queue_json(out_tx, &ServerMessage::error(&e)).await;
                    return;
                }
            };

            let user_id = if authenticated { key.user_id() } else { None };
            match ctx.engine.place_bet(key, user_id, stake, auto).await {
                Ok(ack) => {
                    let frame = ServerMessage::BetPlaced {
                        amount: ack.stake.to_f64(),
                        balance: ack.balance.to_f64(),
                    };
                    queue_json(out_tx, &frame).await;
                }
                Err(e) => queue_json(out_tx, &ServerMessage::error(&e)).await,
            }
        }
        ClientMessage::CashOut => match ctx.engine.cash_out(key).await {
            Ok(ack) => {
                let frame = ServerMessage::CashedOut {
                    multiplier: ack.multiplier.to_f64(),
                    payout: ack.payout.to_f64(),
                    balance: ack.balance.to_f64(),
                };
                queue_json(out_tx, &frame).await;
            }
            Err(e) => queue_json(out_tx, &ServerMessage::error(&e)).await,
        },
        // Application-level keepalive; the transport ping path handles
        // liveness.
        ClientMessage::Ping => {}
    }
}

async fn queue_json(out_tx: &mpsc::Sender<Message>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(json) => {
            let _ = out_tx.send(Message::Text(json)).await;
        }
        Err(e) => warn!(error = %e, "failed to serialize server message"),
    }
}
