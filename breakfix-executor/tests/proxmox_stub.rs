//! Integration test: `ProxmoxClient` against a local stub of `/api2/json`.
//!
//! The stub counts ticket exchanges and rejects calls that carry no ticket
//! cookie, so credential handling is checked end to end over real HTTP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use breakfix_core::Vmid;
use breakfix_executor::{Credentials, Hypervisor, HypervisorConfig, ProxmoxClient};
use serde_json::json;

#[derive(Debug, Default)]
struct Counters {
    tickets: AtomicUsize,
    stops: AtomicUsize,
    deletes: AtomicUsize,
    rejected: AtomicUsize,
}

type Shared = Arc<Counters>;

fn has_ticket(counters: &Counters, headers: &HeaderMap) -> bool {
    let ok = headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("PVEAuthCookie=PVE:ops@pve:"))
        && headers.contains_key("csrfpreventiontoken");
    if !ok {
        counters.rejected.fetch_add(1, Ordering::SeqCst);
    }
    ok
}

async fn ticket(State(counters): State<Shared>) -> Response {
    let n = counters.tickets.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "data": {
            "username": "ops@pve",
            "ticket": format!("PVE:ops@pve:{n}"),
            "CSRFPreventionToken": format!("csrf-{n}"),
        }
    }))
    .into_response()
}

async fn stop_not_running(
    State(counters): State<Shared>,
    headers: HeaderMap,
    Path((_node, vmid)): Path<(String, u32)>,
) -> Response {
    if !has_ticket(&counters, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    counters.stops.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("VM {vmid} not running"),
    )
        .into_response()
}

async fn destroy(
    State(counters): State<Shared>,
    headers: HeaderMap,
    Path((node, vmid)): Path<(String, u32)>,
) -> Response {
    if !has_ticket(&counters, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    counters.deletes.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "data": format!("UPID:{node}:qmdestroy:{vmid}:ops@pve:") })).into_response()
}

async fn next_id(State(counters): State<Shared>, headers: HeaderMap) -> Response {
    if !has_ticket(&counters, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "data": "105" })).into_response()
}

/// Serve the stub on an ephemeral port and return its base URL.
async fn serve(counters: Shared) -> String {
    let app = Router::new()
        .route("/api2/json/access/ticket", post(ticket))
        .route("/api2/json/cluster/nextid", get(next_id))
        .route(
            "/api2/json/nodes/{node}/qemu/{vmid}/status/stop",
            post(stop_not_running),
        )
        .route("/api2/json/nodes/{node}/qemu/{vmid}", delete(destroy))
        .with_state(counters);

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("bind stub: {e}"),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("stub address: {e}"),
    };
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("stub server stopped: {e}");
        }
    });
    format!("http://{addr}")
}

fn ticket_client(base_url: &str) -> ProxmoxClient {
    let config = HypervisorConfig::new(base_url, "pve1", Vmid::new(9000)).with_credentials(
        Credentials::Ticket {
            username: "ops@pve".to_owned(),
            password: "hunter2".to_owned(),
        },
    );
    match ProxmoxClient::new(&config) {
        Ok(c) => c,
        Err(e) => panic!("client should build: {e}"),
    }
}

#[tokio::test]
async fn destroy_tolerates_an_already_stopped_vm() {
    let counters = Shared::default();
    let client = ticket_client(&serve(Arc::clone(&counters)).await);

    let task = match client.destroy(Vmid::new(105)).await {
        Ok(t) => t,
        Err(e) => panic!("destroy should proceed past the rejected stop: {e}"),
    };
    assert_eq!(task.as_str(), "UPID:pve1:qmdestroy:105:ops@pve:");
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    assert_eq!(counters.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(
        counters.tickets.load(Ordering::SeqCst),
        1,
        "stop and delete share one logical call's ticket"
    );
    assert_eq!(counters.rejected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ticket_is_exchanged_for_every_logical_call() {
    let counters = Shared::default();
    let client = ticket_client(&serve(Arc::clone(&counters)).await);

    for expected in 1..=2 {
        let vmid = match client.next_free_id().await {
            Ok(v) => v,
            Err(e) => panic!("next_free_id failed: {e}"),
        };
        assert_eq!(vmid, Vmid::new(105));
        assert_eq!(counters.tickets.load(Ordering::SeqCst), expected);
    }
    assert_eq!(counters.rejected.load(Ordering::SeqCst), 0);
}
