use crate::pw::build_info;
use crate::pw::rpc::{Fault, RpcRequest, RpcResponse, SupervisorHandle};
use askama::Template;
use axum::extract::{Form, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tokio::net::{TcpListener, UnixListener};

/// Per-server state shared by every connection: the door into the event
/// loop plus the configured basic-auth credentials.
#[derive(Clone)]
pub struct WebState {
    handle: SupervisorHandle,
    username: Option<String>,
    password: Option<String>,
    identifier: String,
}

impl WebState {
    pub fn new(
        handle: SupervisorHandle,
        username: Option<String>,
        password: Option<String>,
        identifier: String,
    ) -> Self {
        Self {
            handle,
            username,
            password,
            identifier,
        }
    }
}

pub fn router(state: WebState) -> Router {
    let auth_state = state.clone();
    Router::new()
        .route("/", get(status_page))
        .route("/action", post(action_form))
        .route("/rpc", post(rpc_endpoint))
        .with_state(state)
        .layer(middleware::from_fn_with_state(auth_state, basic_auth_middleware))
}

pub fn spawn_tcp_server(listener: TcpListener, state: WebState) {
    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("procwarden: RPC server stopped: {e}");
        }
    });
}

pub fn spawn_unix_server(listener: UnixListener, state: WebState) {
    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("procwarden: RPC server stopped: {e}");
        }
    });
}

// ---------------- authentication ----------------

async fn basic_auth_middleware(
    State(st): State<WebState>,
    req: Request,
    next: Next,
) -> Response {
    let (Some(user), Some(pass)) = (&st.username, &st.password) else {
        // No credentials configured; on UNIX-domain transport access
        // control is the socket's mode and ownership.
        return next.run(req).await;
    };
    match check_basic_auth(user, pass, req.headers()) {
        Ok(()) => next.run(req).await,
        Err(msg) => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, r#"Basic realm="procwarden""#)],
            msg,
        )
            .into_response(),
    }
}

fn check_basic_auth(user: &str, pass: &str, headers: &HeaderMap) -> Result<(), String> {
    let Some(v) = headers.get(header::AUTHORIZATION) else {
        return Err("missing Authorization header".to_string());
    };
    let Ok(s) = v.to_str() else {
        return Err("invalid Authorization header".to_string());
    };
    let s = s.trim();
    let Some(b64) = s.strip_prefix("Basic ").or_else(|| s.strip_prefix("basic ")) else {
        return Err("expected Basic authorization".to_string());
    };
    let decoded = BASE64
        .decode(b64.trim().as_bytes())
        .map_err(|_| "invalid base64 in Authorization".to_string())?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| "invalid utf8 in Authorization".to_string())?;
    let Some((u, p)) = decoded.split_once(':') else {
        return Err("invalid basic auth payload".to_string());
    };
    if u == user && p == pass {
        Ok(())
    } else {
        Err("invalid credentials".to_string())
    }
}

// ---------------- control-call endpoint ----------------

async fn rpc_endpoint(State(st): State<WebState>, body: String) -> Response {
    let value: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            let resp = RpcResponse::fault(Value::Null, Fault::parse_error(e.to_string()));
            return Json(resp).into_response();
        }
    };
    match value {
        // Batched multi-call: a sequence of envelopes answered in order.
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(dispatch_value(&st, item).await);
            }
            Json(out).into_response()
        }
        single => Json(dispatch_value(&st, single).await).into_response(),
    }
}

async fn dispatch_value(st: &WebState, v: Value) -> RpcResponse {
    let id = v.get("id").cloned().unwrap_or(Value::Null);
    match serde_json::from_value::<RpcRequest>(v) {
        Ok(req) => st.handle.dispatch(req).await,
        Err(e) => RpcResponse::fault(id, Fault::invalid_request(e.to_string())),
    }
}

// ---------------- HTML surface ----------------

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate {
    identifier: String,
    banner: String,
    processes: Vec<ProcRow>,
}

struct ProcRow {
    name: String,
    state: &'static str,
    description: String,
}

async fn status_page(State(st): State<WebState>) -> Response {
    let infos = match st.handle.all_process_info().await {
        Ok(i) => i,
        Err(f) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, f.message).into_response();
        }
    };
    let t = StatusTemplate {
        identifier: st.identifier.clone(),
        banner: build_info::banner(),
        processes: infos
            .into_iter()
            .map(|i| ProcRow {
                name: i.name,
                state: i.state,
                description: i.description,
            })
            .collect(),
    };
    match t.render() {
        Ok(s) => Html(s).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
struct ActionForm {
    name: String,
    action: String,
}

/// Thin adapter: the HTML forms drive the same control calls as /rpc.
async fn action_form(State(st): State<WebState>, Form(form): Form<ActionForm>) -> Response {
    let result = match form.action.as_str() {
        "start" => st.handle.start_process(form.name, true).await,
        "stop" => st.handle.stop_process(form.name, true).await,
        "restart" => {
            match st.handle.stop_process(form.name.clone(), true).await {
                Ok(_) => st.handle.start_process(form.name, true).await,
                Err(f) => Err(f),
            }
        }
        other => Err(Fault::incorrect_parameters(format!("unknown action {other:?}"))),
    };
    match result {
        Ok(_) => Redirect::to("/").into_response(),
        Err(f) => (StatusCode::BAD_REQUEST, format!("{} ({})", f.message, f.code)).into_response(),
    }
}
