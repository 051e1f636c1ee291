use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::handlers::{PurposeHandler, TicketContext};
use super::provider::{CredentialSource, OAuthProvider};
use super::{CallbackState, Frame, Purpose, QrLoginBroker};
use crate::error::{AppError, AppResult};

/// Returned to the browser that asked for a QR code
#[derive(Debug, Clone, Serialize)]
pub struct IssuedTicket {
    pub ticket: String,
    pub qr_code_url: String,
    pub auth_url: String,
    pub expire_seconds: u64,
}

/// Redirect URI handed to the provider.
///
/// A configured callback domain always wins, keeping only the path of whatever
/// was requested. Without one the request is trusted as-is.
pub fn effective_redirect_uri(callback_domain: &str, requested: Option<&str>, origin: &str, purpose: Purpose) -> String {
    let requested = requested.map(str::trim).filter(|r| !r.is_empty());
    let domain = callback_domain.trim().trim_end_matches('/');

    if domain.is_empty() {
        return match requested {
            Some(uri) => uri.to_string(),
            None => format!("{}{}", origin.trim_end_matches('/'), purpose.callback_path()),
        };
    }

    let path = match requested {
        Some(uri) if uri.starts_with('/') => uri.to_string(),
        Some(uri) => reqwest::Url::parse(uri)
            .ok()
            .map(|url| url.path().to_string())
            .filter(|path| path != "/" && !path.is_empty())
            .unwrap_or_else(|| purpose.callback_path().to_string()),
        None => purpose.callback_path().to_string(),
    };

    format!("{domain}{path}")
}

/// Ties the broker, the provider and the purpose handlers together
pub struct QrLogin {
    broker: Arc<QrLoginBroker>,
    provider: Arc<dyn OAuthProvider>,
    credentials: Arc<dyn CredentialSource>,
    callback_domain: String,
}

impl QrLogin {
    pub fn new(
        broker: Arc<QrLoginBroker>,
        provider: Arc<dyn OAuthProvider>,
        credentials: Arc<dyn CredentialSource>,
        callback_domain: String,
    ) -> Self {
        Self {
            broker,
            provider,
            credentials,
            callback_domain,
        }
    }

    pub fn broker(&self) -> &Arc<QrLoginBroker> {
        &self.broker
    }

    /// Create a ticket and the authorization URL the browser turns into a QR code
    pub async fn issue_ticket(
        &self,
        purpose: Purpose,
        bind_user: Option<i32>,
        requested_redirect: Option<&str>,
        origin: &str,
    ) -> AppResult<IssuedTicket> {
        let creds = self.credentials.load().await?;
        let redirect_uri = effective_redirect_uri(&self.callback_domain, requested_redirect, origin, purpose);

        let ticket = self.broker.issue(purpose, bind_user);
        let state = CallbackState::encode(&ticket, bind_user);
        let payload = self.provider.qr_payload(&creds, &redirect_uri, &state)?;

        info!("Issued {:?} QR ticket redirecting to {}", purpose, redirect_uri);
        Ok(IssuedTicket {
            ticket,
            qr_code_url: payload.auth_url.clone(),
            auth_url: payload.auth_url,
            expire_seconds: self.broker.ttl().as_secs().min(payload.expire_seconds),
        })
    }

    /// Complete the provider redirect for `handler`'s purpose.
    /// The outcome is pushed to the waiting browser exactly once.
    pub async fn handle_callback(&self, handler: &dyn PurposeHandler, code: Option<&str>, state: &str) -> AppResult<Value> {
        let state = CallbackState::parse(state)?;
        self.broker.claim(&state.ticket, handler.purpose(), state.bind_user)?;

        let ctx = TicketContext {
            ticket: state.ticket,
            purpose: handler.purpose(),
            bind_user: state.bind_user,
        };

        match self.complete(handler, &ctx, code).await {
            Ok(payload) => {
                let (title, _) = handler.success_text();
                self.broker.finish(&ctx.ticket, Frame::success(title, payload.clone()));
                Ok(payload)
            }
            Err(err) => {
                warn!("QR callback for ticket {} failed: {}", ctx.ticket, err);
                self.broker.finish(&ctx.ticket, Frame::error(err.public_message()));
                Err(err)
            }
        }
    }

    async fn complete(&self, handler: &dyn PurposeHandler, ctx: &TicketContext, code: Option<&str>) -> AppResult<Value> {
        let code = code
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::InvalidArgument("authorization code missing".to_string()))?;

        let creds = self.credentials.load().await?;
        handler.validate(ctx).await?;

        self.broker.push(&ctx.ticket, Frame::info("scanned, requesting authorization…"));
        let grant = self.provider.exchange_code(&creds, code).await.map_err(|err| match err {
            AppError::Upstream(detail) => AppError::Upstream(format!(
                "{detail}; app_id={}, app_secret={}",
                creds.app_id,
                creds.masked_secret()
            )),
            other => other,
        })?;

        self.broker.push(&ctx.ticket, Frame::info("fetching user profile…"));
        let profile = self.provider.fetch_profile(&grant).await?.fitted();

        handler.process(ctx, &profile).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qrlogin::provider::{AccessGrant, AccountType, Credentials, ExternalProfile};
    use crate::qrlogin::{FrameEvent, TicketPhase};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedCredentials;

    #[async_trait]
    impl CredentialSource for FixedCredentials {
        async fn load(&self) -> AppResult<Credentials> {
            Ok(Credentials {
                app_id: "wxtest".into(),
                app_secret: "secretsecret1234".into(),
                account_type: AccountType::OpenPlatform,
                scope: "snsapi_userinfo".into(),
            })
        }
    }

    struct FakeProvider {
        reject_code: bool,
    }

    #[async_trait]
    impl OAuthProvider for FakeProvider {
        fn authorization_url(&self, _creds: &Credentials, redirect_uri: &str, state: &str) -> AppResult<String> {
            Ok(format!("https://provider.test/auth?redirect_uri={redirect_uri}&state={state}"))
        }

        async fn exchange_code(&self, _creds: &Credentials, code: &str) -> AppResult<AccessGrant> {
            if self.reject_code {
                return Err(AppError::Upstream("code expired".into()));
            }
            Ok(AccessGrant {
                access_token: format!("at-{code}"),
                open_id: "open-1".into(),
                ..Default::default()
            })
        }

        async fn fetch_profile(&self, grant: &AccessGrant) -> AppResult<ExternalProfile> {
            Ok(ExternalProfile {
                open_id: grant.open_id.clone(),
                nickname: "Ann".into(),
                ..Default::default()
            })
        }
    }

    #[derive(Default)]
    struct CountingLogin {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PurposeHandler for CountingLogin {
        fn purpose(&self) -> Purpose {
            Purpose::Login
        }

        async fn process(&self, _ctx: &TicketContext, profile: &ExternalProfile) -> AppResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "token": "signed-token", "user": { "username": profile.nickname } }))
        }

        fn success_text(&self) -> (&'static str, &'static str) {
            ("ok", "")
        }

        fn failure_title(&self) -> &'static str {
            "failed"
        }
    }

    fn qr_login(reject_code: bool) -> QrLogin {
        QrLogin::new(
            Arc::new(QrLoginBroker::new(Duration::from_secs(600))),
            Arc::new(FakeProvider { reject_code }),
            Arc::new(FixedCredentials),
            String::new(),
        )
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_callback_pushes_one_success_then_conflicts() {
        let login = qr_login(false);
        let handler = CountingLogin::default();
        let issued = login.issue_ticket(Purpose::Login, None, None, "http://localhost:8080").await.unwrap();
        assert_eq!(issued.expire_seconds, 600);
        assert!(issued.auth_url.contains(&format!("state=ticket:{}", issued.ticket)));

        let mut rx = login.broker().open_channel(&issued.ticket).unwrap();
        let state = format!("ticket:{}", issued.ticket);
        let payload = login.handle_callback(&handler, Some("c"), &state).await.unwrap();
        assert_eq!(payload["token"], "signed-token");

        let err = login.handle_callback(&handler, Some("c"), &state).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let frames = drain(&mut rx);
        let events: Vec<FrameEvent> = frames.iter().map(|f| f.event).collect();
        assert_eq!(events, vec![FrameEvent::Info, FrameEvent::Info, FrameEvent::Success]);
        assert_eq!(frames[2].payload.as_ref().unwrap()["token"], "signed-token");
    }

    #[tokio::test]
    async fn test_missing_code_fails_the_ticket() {
        let login = qr_login(false);
        let handler = CountingLogin::default();
        let issued = login.issue_ticket(Purpose::Login, None, None, "http://localhost").await.unwrap();
        let mut rx = login.broker().open_channel(&issued.ticket).unwrap();

        let err = login
            .handle_callback(&handler, None, &format!("ticket:{}", issued.ticket))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        assert_eq!(login.broker().phase(&issued.ticket), Some(TicketPhase::Error));

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, FrameEvent::Error);
    }

    #[tokio::test]
    async fn test_exchange_failure_masks_secret() {
        let login = qr_login(true);
        let handler = CountingLogin::default();
        let issued = login.issue_ticket(Purpose::Login, None, None, "http://localhost").await.unwrap();

        let err = login
            .handle_callback(&handler, Some("c"), &format!("ticket:{}", issued.ticket))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("secr****1234"), "{message}");
        assert!(!message.contains("secretsecret1234"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        let mut rx = login.broker().open_channel(&issued.ticket).unwrap();
        let events: Vec<FrameEvent> = drain(&mut rx).iter().map(|f| f.event).collect();
        assert_eq!(events, vec![FrameEvent::Info, FrameEvent::Error]);
    }

    #[tokio::test]
    async fn test_ticket_for_other_purpose_is_rejected() {
        let login = qr_login(false);
        let issued = login.issue_ticket(Purpose::AddUser, None, None, "http://localhost").await.unwrap();

        let err = login
            .handle_callback(&CountingLogin::default(), Some("c"), &format!("ticket:{}", issued.ticket))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        assert_eq!(login.broker().phase(&issued.ticket), Some(TicketPhase::Pending));
    }

    #[test]
    fn test_redirect_uri_resolution() {
        assert_eq!(
            effective_redirect_uri("", None, "http://localhost:5173/", Purpose::Login),
            "http://localhost:5173/api/auth/wechat/callback"
        );
        assert_eq!(
            effective_redirect_uri("", Some("https://a.test/cb"), "http://x", Purpose::Login),
            "https://a.test/cb"
        );
        assert_eq!(
            effective_redirect_uri(
                "https://pm.example.com/",
                Some("http://localhost:5173/api/auth/wechat/add-user/callback"),
                "http://x",
                Purpose::AddUser
            ),
            "https://pm.example.com/api/auth/wechat/add-user/callback"
        );
        assert_eq!(
            effective_redirect_uri("https://pm.example.com", None, "http://x", Purpose::Bind),
            "https://pm.example.com/api/auth/wechat/bind/callback"
        );
        assert_eq!(
            effective_redirect_uri("https://pm.example.com", Some("/custom"), "http://x", Purpose::Login),
            "https://pm.example.com/custom"
        );
    }
}
