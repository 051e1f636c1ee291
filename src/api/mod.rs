//! HTTP surface: shared state, routing and the request-origin helper

use axum::{
    Router,
    http::{HeaderMap, header::HOST},
    routing::{delete, get, post, put},
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthService, JwtConfig};
use crate::config::Settings;
use crate::qrlogin::provider::StoredCredentials;
use crate::qrlogin::{OAuthProvider, QrLogin, QrLoginBroker};

pub mod auth_handlers;
pub mod directory_handlers;
pub mod qr_handlers;
pub mod report_handlers;
pub mod system_handlers;
pub mod work_handlers;

/// Permission codes checked by the handlers
pub mod perm {
    pub const USER_CREATE: &str = "user:create";
    pub const USER_UPDATE: &str = "user:update";
    pub const USER_DELETE: &str = "user:delete";
    pub const PROJECT_READ: &str = "project:read";
    pub const PROJECT_CREATE: &str = "project:create";
    pub const PROJECT_UPDATE: &str = "project:update";
    pub const PROJECT_DELETE: &str = "project:delete";
    pub const DEPARTMENT_DELETE: &str = "department:delete";
    pub const PERMISSION_MANAGE: &str = "permission:manage";
    pub const REQUIREMENT_READ: &str = "requirement:read";
    pub const TASK_READ: &str = "task:read";
    pub const TASK_UPDATE: &str = "task:update";
    pub const TASK_DELETE: &str = "task:delete";
    pub const BUG_READ: &str = "bug:read";
    pub const BUG_UPDATE: &str = "bug:update";
    pub const RESOURCE_READ: &str = "resource:read";
    pub const RESOURCE_MANAGE: &str = "resource:manage";
    pub const SYSTEM_SETTINGS: &str = "system:settings";
    pub const WECHAT_SETTINGS: &str = "wechat:settings";
}

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub jwt_config: Arc<JwtConfig>,
    pub auth: AuthService,
    pub qr: Arc<QrLogin>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(db_pool: PgPool, settings: Settings, provider: Arc<dyn OAuthProvider>) -> Self {
        let jwt_config = Arc::new(JwtConfig::from_settings(&settings.jwt));
        let auth = AuthService::new(db_pool.clone(), jwt_config.clone());

        let broker = Arc::new(QrLoginBroker::new(Duration::from_secs(settings.wechat.ticket_ttl_seconds)));
        let credentials = Arc::new(StoredCredentials::new(db_pool.clone(), settings.wechat.clone()));
        let qr = Arc::new(QrLogin::new(
            broker,
            provider,
            credentials,
            settings.wechat.callback_domain.clone(),
        ));

        Self {
            db_pool,
            jwt_config,
            auth,
            qr,
            settings: Arc::new(settings),
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let auth = Router::new()
        .route("/login", post(auth_handlers::login))
        .route("/me", get(auth_handlers::me))
        .route("/password", put(auth_handlers::change_password))
        .route("/menus", get(auth_handlers::menus))
        .route("/wechat/qrcode", get(qr_handlers::login_qrcode))
        .route("/wechat/callback", get(qr_handlers::login_callback))
        .route("/wechat/add-user/callback", get(qr_handlers::add_user_callback))
        .route("/wechat/bind/callback", get(qr_handlers::bind_callback));

    let init = Router::new()
        .route("/status", get(qr_handlers::init_status))
        .route("/qrcode", get(qr_handlers::init_qrcode))
        .route("/callback", get(qr_handlers::init_callback));

    let users = Router::new()
        .route("/wechat/add", post(qr_handlers::add_user_qrcode))
        .route("/:id/wechat/bind/qrcode", get(qr_handlers::bind_qrcode))
        .route("/:id", delete(directory_handlers::delete_user));

    let projects = Router::new()
        .route("/", get(directory_handlers::list_projects).post(directory_handlers::create_project))
        .route("/:id", delete(directory_handlers::delete_project))
        .route("/:id/members", post(directory_handlers::add_member));

    let tasks = Router::new()
        .route("/", get(work_handlers::list_tasks))
        .route("/:id", put(work_handlers::update_task).delete(work_handlers::delete_task))
        .route("/:id/dependencies", put(work_handlers::set_dependencies));

    let bugs = Router::new()
        .route("/", get(work_handlers::list_bugs))
        .route("/:id", put(work_handlers::update_bug));

    let allocations = Router::new()
        .route("/", get(work_handlers::list_allocations).post(work_handlers::create_allocation))
        .route(
            "/:id",
            put(work_handlers::update_allocation).delete(work_handlers::delete_allocation),
        );

    let reports = Router::new()
        .route("/daily", post(report_handlers::create_daily))
        .route("/weekly", post(report_handlers::create_weekly))
        .route("/work-summary", get(report_handlers::work_summary))
        .route("/:kind/:id", get(report_handlers::get_report))
        .route("/:kind/:id/approvers", put(report_handlers::replace_approvers))
        .route("/:kind/:id/submit", post(report_handlers::submit))
        .route("/:kind/:id/approve", post(report_handlers::decide));

    let system = Router::new()
        .route("/configs/:key", get(system_handlers::get_config).put(system_handlers::set_config))
        .route("/wechat-config", post(system_handlers::save_wechat_config))
        .route("/wechat-verify", post(system_handlers::save_verify_file));

    let api = Router::new()
        .nest("/auth", auth)
        .nest("/init", init)
        .nest("/users", users)
        .nest("/projects", projects)
        .nest("/tasks", tasks)
        .nest("/bugs", bugs)
        .route("/requirements", get(work_handlers::list_requirements))
        .nest("/resource-allocations", allocations)
        .nest("/reports", reports)
        .route("/departments/:id", delete(directory_handlers::delete_department))
        .route("/roles/:id", delete(directory_handlers::delete_role))
        .route("/permissions/:id", delete(directory_handlers::delete_permission))
        .route("/permissions/:id/parent", put(directory_handlers::set_menu_parent))
        .route("/tags/:id", delete(directory_handlers::delete_tag))
        .route("/modules/:id", delete(directory_handlers::delete_module))
        .nest("/system", system);

    Router::new()
        .nest("/api", api)
        .route("/ws", get(qr_handlers::ticket_socket))
        .route("/:file_name", get(system_handlers::verify_file))
        .with_state(state)
}

/// Scheme and host the browser used, honouring a fronting proxy
pub fn request_origin(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let scheme = header("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = header("x-forwarded-host")
        .or_else(|| header(HOST.as_str()))
        .unwrap_or_else(|| "localhost".to_string());
    format!("{scheme}://{host}")
}


#[cfg(test)]
mod tests {
    use super::testing::offline_app;
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode, header::AUTHORIZATION},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let response = offline_app()
            .oneshot(Request::builder().uri("/api/auth/me").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["code"], 40100);
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn test_forged_token_is_unauthorized() {
        let response = offline_app()
            .oneshot(
                Request::builder()
                    .uri("/api/tasks?status=todo")
                    .header(AUTHORIZATION, "Bearer not.a.jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_callback_state_renders_failure_page() {
        let response = offline_app()
            .oneshot(
                Request::builder()
                    .uri("/api/auth/wechat/callback?code=abc&state=garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response).await;
        assert!(html.contains("登录失败"));
    }

    #[tokio::test]
    async fn test_unknown_ticket_callback_reports_expiry() {
        let response = offline_app()
            .oneshot(
                Request::builder()
                    .uri("/api/init/callback?code=abc&state=ticket:deadbeef")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let html = body_text(response).await;
        assert!(html.contains("初始化失败"));
    }

    #[tokio::test]
    async fn test_unrelated_root_files_are_not_found() {
        let response = offline_app()
            .oneshot(Request::builder().uri("/robots.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_request_origin_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "10.0.0.5:8080".parse().unwrap());
        assert_eq!(request_origin(&headers), "http://10.0.0.5:8080");

        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        headers.insert("x-forwarded-host", "pm.example.com, proxy.local".parse().unwrap());
        assert_eq!(request_origin(&headers), "https://pm.example.com");
    }
}
