use axum::{
    Json,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{Html, IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use super::{AppState, perm, request_origin};
use crate::auth::RequestContext;
use crate::error::{AppError, AppResult, Envelope};
use crate::qrlogin::handlers::{AddUserHandler, BindHandler, InitializeHandler, LoginHandler};
use crate::qrlogin::pages::{failure_page, success_page};
use crate::qrlogin::{Frame, IssuedTicket, Purpose, PurposeHandler};
use crate::sysconfig;

#[derive(Debug, Default, Deserialize)]
pub struct QrCodeQuery {
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    #[serde(default)]
    pub state: String,
}

async fn issue(
    state: &AppState,
    purpose: Purpose,
    bind_user: Option<i32>,
    query: &QrCodeQuery,
    headers: &HeaderMap,
) -> AppResult<Json<Envelope<IssuedTicket>>> {
    let origin = request_origin(headers);
    let issued = state
        .qr
        .issue_ticket(purpose, bind_user, query.redirect_uri.as_deref(), &origin)
        .await?;
    Ok(Json(Envelope::ok(issued)))
}

/// Run a provider redirect through `handler` and render the page the phone shows
async fn complete(state: &AppState, handler: &dyn PurposeHandler, query: CallbackQuery) -> AppResult<Html<String>> {
    match state.qr.handle_callback(handler, query.code.as_deref(), &query.state).await {
        Ok(_) => {
            let (title, message) = handler.success_text();
            Ok(Html(success_page(title, message)?))
        }
        Err(err) => {
            warn!("{:?} callback rejected: {}", handler.purpose(), err);
            Ok(Html(failure_page(handler.failure_title(), &err.public_message())?))
        }
    }
}

pub async fn login_qrcode(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<QrCodeQuery>,
) -> AppResult<Json<Envelope<IssuedTicket>>> {
    issue(&state, Purpose::Login, None, &query, &headers).await
}

pub async fn login_callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> AppResult<Html<String>> {
    let handler = LoginHandler::new(state.db_pool.clone(), state.auth.clone());
    complete(&state, &handler, query).await
}

#[derive(Debug, Serialize)]
pub struct InitStatus {
    pub initialized: bool,
}

pub async fn init_status(State(state): State<AppState>) -> AppResult<Json<Envelope<InitStatus>>> {
    let mut conn = state.db_pool.acquire().await?;
    let initialized = sysconfig::is_initialized(&mut conn).await?;
    Ok(Json(Envelope::ok(InitStatus { initialized })))
}

pub async fn init_qrcode(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<QrCodeQuery>,
) -> AppResult<Json<Envelope<IssuedTicket>>> {
    let mut conn = state.db_pool.acquire().await?;
    if sysconfig::is_initialized(&mut conn).await? {
        return Err(AppError::Conflict("system is already initialized".to_string()));
    }
    drop(conn);
    issue(&state, Purpose::Initialize, None, &query, &headers).await
}

pub async fn init_callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> AppResult<Html<String>> {
    let handler = InitializeHandler::new(state.db_pool.clone(), state.auth.clone());
    complete(&state, &handler, query).await
}

pub async fn add_user_qrcode(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
    Query(query): Query<QrCodeQuery>,
) -> AppResult<Json<Envelope<IssuedTicket>>> {
    ctx.require(perm::USER_CREATE)?;
    issue(&state, Purpose::AddUser, None, &query, &headers).await
}

pub async fn add_user_callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> AppResult<Html<String>> {
    let handler = AddUserHandler::new(state.db_pool.clone());
    complete(&state, &handler, query).await
}

/// QR code an administrator shows to the user being bound
pub async fn bind_qrcode(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(user_id): Path<i32>,
    headers: HeaderMap,
    Query(query): Query<QrCodeQuery>,
) -> AppResult<Json<Envelope<IssuedTicket>>> {
    ctx.require(perm::USER_UPDATE)?;

    let live: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND deleted_at IS NULL)")
        .bind(user_id)
        .fetch_one(&state.db_pool)
        .await?;
    if !live {
        return Err(AppError::not_found("user"));
    }

    issue(&state, Purpose::Bind, Some(user_id), &query, &headers).await
}

pub async fn bind_callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> AppResult<Html<String>> {
    let handler = BindHandler::new(state.db_pool.clone());
    complete(&state, &handler, query).await
}

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    pub ticket: String,
}

/// Browser side of a ticket: frames pushed by the callback arrive here
pub async fn ticket_socket(
    State(state): State<AppState>,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let frames = state.qr.broker().open_channel(&query.ticket)?;
    info!("Browser attached to ticket {}", query.ticket);
    Ok(ws
        .on_upgrade(move |socket| pump_frames(socket, frames, query.ticket))
        .into_response())
}

async fn pump_frames(mut socket: WebSocket, mut frames: UnboundedReceiver<Frame>, ticket: String) {
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode frame for ticket {}: {}", ticket, e);
                        break;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if frame.is_terminal() {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("Socket for ticket {} closed", ticket);
}
