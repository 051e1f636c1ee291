//! Out-of-band QR login: a browser waits on a ticket while a phone completes
//! the provider's OAuth grant, and the result is pushed back over the ticket.

pub mod callback;
pub mod handlers;
pub mod pages;
pub mod provider;

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

pub use callback::{IssuedTicket, QrLogin};
pub use handlers::{PurposeHandler, TicketContext};
pub use provider::{Credentials, ExternalProfile, OAuthProvider, WeChatClient};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// What a ticket was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Login,
    Initialize,
    AddUser,
    Bind,
}

impl Purpose {
    /// Path the provider redirects the phone to
    pub const fn callback_path(self) -> &'static str {
        match self {
            Self::Login => "/api/auth/wechat/callback",
            Self::Initialize => "/api/init/callback",
            Self::AddUser => "/api/auth/wechat/add-user/callback",
            Self::Bind => "/api/auth/wechat/bind/callback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEvent {
    Info,
    Success,
    Error,
}

/// A server-to-browser push message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub event: FrameEvent,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Frame {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            event: FrameEvent::Info,
            message: message.into(),
            payload: None,
        }
    }

    pub fn success(message: impl Into<String>, payload: Value) -> Self {
        Self {
            event: FrameEvent::Success,
            message: message.into(),
            payload: Some(payload),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: FrameEvent::Error,
            message: message.into(),
            payload: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event != FrameEvent::Info
    }
}

/// The OAuth `state` round-tripped through the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackState {
    pub ticket: String,
    pub bind_user: Option<i32>,
}

impl CallbackState {
    /// `ticket:<t>` or, when binding, `bind:<t>:<user id>`
    pub fn encode(ticket: &str, bind_user: Option<i32>) -> String {
        match bind_user {
            Some(user_id) => format!("bind:{ticket}:{user_id}"),
            None => format!("ticket:{ticket}"),
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        let malformed = || AppError::InvalidArgument(format!("malformed state '{raw}'"));

        if let Some(ticket) = raw.strip_prefix("ticket:") {
            if ticket.is_empty() || ticket.contains(':') {
                return Err(malformed());
            }
            return Ok(Self {
                ticket: ticket.to_string(),
                bind_user: None,
            });
        }

        if let Some(rest) = raw.strip_prefix("bind:") {
            let (ticket, user_id) = rest.rsplit_once(':').ok_or_else(malformed)?;
            let user_id = user_id.parse::<i32>().map_err(|_| malformed())?;
            if ticket.is_empty() || ticket.contains(':') {
                return Err(malformed());
            }
            return Ok(Self {
                ticket: ticket.to_string(),
                bind_user: Some(user_id),
            });
        }

        Err(malformed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketPhase {
    Pending,
    Scanned,
    Bound,
    Error,
}

struct TicketSession {
    purpose: Purpose,
    bind_user: Option<i32>,
    issued_at: Instant,
    phase: TicketPhase,
    sender: Option<UnboundedSender<Frame>>,
    /// Frames produced before the browser attached
    backlog: Vec<Frame>,
}

impl TicketSession {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() >= ttl
    }
}

/// In-process map of live tickets and their push channels
pub struct QrLoginBroker {
    sessions: Mutex<HashMap<String, TicketSession>>,
    ttl: Duration,
}

impl QrLoginBroker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TicketSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            warn!("QR ticket map mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Register a fresh pending ticket
    pub fn issue(&self, purpose: Purpose, bind_user: Option<i32>) -> String {
        let ticket = uuid::Uuid::new_v4().simple().to_string();
        self.lock().insert(
            ticket.clone(),
            TicketSession {
                purpose,
                bind_user,
                issued_at: Instant::now(),
                phase: TicketPhase::Pending,
                sender: None,
                backlog: Vec::new(),
            },
        );

        debug!("Issued QR ticket {} for {:?}", ticket, purpose);
        ticket
    }

    /// Attach a browser to `ticket`. Buffered frames are replayed first.
    pub fn open_channel(&self, ticket: &str) -> AppResult<UnboundedReceiver<Frame>> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(ticket)
            .filter(|session| !session.is_expired(self.ttl))
            .ok_or_else(expired)?;

        let (tx, rx) = mpsc::unbounded_channel();
        // Nobody holds `rx` yet, so these sends cannot block or fail.
        for frame in session.backlog.drain(..) {
            let _ = tx.send(frame);
        }
        session.sender = Some(tx);

        debug!("Browser attached to QR ticket {}", ticket);
        Ok(rx)
    }

    /// Move a pending ticket to scanned, checking it belongs to this callback
    pub fn claim(&self, ticket: &str, purpose: Purpose, bind_user: Option<i32>) -> AppResult<()> {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(ticket) else {
            return Err(expired());
        };

        if session.purpose != purpose || session.bind_user != bind_user {
            warn!("QR ticket {} presented for the wrong purpose", ticket);
            return Err(AppError::InvalidArgument("ticket was issued for a different purpose".to_string()));
        }

        if session.is_expired(self.ttl) {
            let was_live = matches!(session.phase, TicketPhase::Pending | TicketPhase::Scanned);
            session.phase = TicketPhase::Error;
            drop(sessions);
            if was_live {
                self.deliver(ticket, Frame::error("QR code expired, please refresh"));
            }
            return Err(expired());
        }

        if session.phase != TicketPhase::Pending {
            warn!("QR ticket {} reused in phase {:?}", ticket, session.phase);
            return Err(AppError::Conflict("ticket has already been used".to_string()));
        }

        session.phase = TicketPhase::Scanned;
        Ok(())
    }

    /// Push a progress frame on a ticket that is still in flight
    pub fn push(&self, ticket: &str, frame: Frame) {
        let in_flight = self
            .lock()
            .get(ticket)
            .is_some_and(|session| session.phase == TicketPhase::Scanned);
        if in_flight {
            self.deliver(ticket, frame);
        }
    }

    /// Close a scanned ticket with its single terminal frame.
    /// Returns false when the ticket was not awaiting one.
    pub fn finish(&self, ticket: &str, frame: Frame) -> bool {
        {
            let mut sessions = self.lock();
            let Some(session) = sessions.get_mut(ticket) else {
                return false;
            };
            if session.phase != TicketPhase::Scanned {
                return false;
            }
            session.phase = match frame.event {
                FrameEvent::Success => TicketPhase::Bound,
                _ => TicketPhase::Error,
            };
        }

        info!("QR ticket {} finished with {:?}", ticket, frame.event);
        self.deliver(ticket, frame);
        true
    }

    pub fn phase(&self, ticket: &str) -> Option<TicketPhase> {
        self.lock().get(ticket).map(|session| session.phase)
    }

    fn deliver(&self, ticket: &str, frame: Frame) {
        let sender = {
            let mut sessions = self.lock();
            let Some(session) = sessions.get_mut(ticket) else {
                return;
            };
            match &session.sender {
                Some(sender) => sender.clone(),
                None => {
                    session.backlog.push(frame);
                    return;
                }
            }
        };

        if let Err(mpsc::error::SendError(frame)) = sender.send(frame) {
            let mut sessions = self.lock();
            if let Some(session) = sessions.get_mut(ticket) {
                if session.sender.as_ref().is_some_and(|s| s.same_channel(&sender)) {
                    session.sender = None;
                }
                session.backlog.push(frame);
            }
        }
    }

    /// Drop tickets older than the TTL; returns how many went
    pub fn sweep(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(self.ttl));
        before - sessions.len()
    }

    /// Periodically sweep expired tickets until the handle is aborted
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!("Swept {} expired QR tickets", removed);
                }
            }
        })
    }
}

fn expired() -> AppError {
    AppError::Expired("QR code expired or unknown, please refresh".to_string())
}
