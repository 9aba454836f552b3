//! HTTP API of the collection sink
//!
//! Routes:
//! - `GET|POST /api/messages/`, `PUT|DELETE /api/messages/{id}`
//! - `GET|POST /api/gates/`, `PUT|DELETE /api/gates/{id}`
//! - `GET|POST /api/events/`, `PUT|DELETE /api/events/{id}`
//! - `GET|POST /api/collect_items/` runs gate correlation
//! - `GET /health`
//!
//! A re-posted delivery record is acknowledged with 200 so agents stop
//! retrying it; re-posted gates and events are rejected with 400.

use crate::domain::records::{CrossingEvent, DeliveryRecord, GateDefinition};
use crate::services::correlator;
use crate::services::sink_store::{Insert, SinkStore, StoreError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

type HttpResponse = Response<Full<Bytes>>;

/// Table addressed by a request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Messages,
    Gates,
    Events,
}

/// Parsed request target
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Collect,
    List(Collection),
    Item(Collection, u64),
    NotFound,
}

fn parse_route(path: &str) -> Route {
    if path == "/health" {
        return Route::Health;
    }
    let Some(rest) = path.strip_prefix("/api/") else {
        return Route::NotFound;
    };
    let mut parts = rest.split('/').filter(|p| !p.is_empty());
    let collection = match parts.next() {
        Some("messages") => Collection::Messages,
        Some("gates") => Collection::Gates,
        Some("events") => Collection::Events,
        Some("collect_items") if parts.next().is_none() => return Route::Collect,
        _ => return Route::NotFound,
    };
    match (parts.next(), parts.next()) {
        (None, _) => Route::List(collection),
        (Some(id), None) => match id.parse() {
            Ok(id) => Route::Item(collection, id),
            Err(_) => Route::NotFound,
        },
        _ => Route::NotFound,
    }
}

fn json_response(status: StatusCode, value: &impl Serialize) -> HttpResponse {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "sink_response_encode_failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "encode_failed");
        }
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, error: &str) -> HttpResponse {
    let body = format!(r#"{{"ok":false,"error":"{error}"}}"#);
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn store_failure(e: StoreError) -> HttpResponse {
    error!(error = %e, "sink_store_failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_failed")
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, HttpResponse> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "sink_body_read_failed");
            return Err(error_response(StatusCode::BAD_REQUEST, "unreadable_body"));
        }
    };
    serde_json::from_slice(&body).map_err(|e| {
        debug!(error = %e, "sink_body_invalid");
        error_response(StatusCode::BAD_REQUEST, "invalid_body")
    })
}

fn insert_response(result: Result<Insert, StoreError>, duplicate_ok: bool) -> HttpResponse {
    match result {
        Ok(Insert::Inserted(id)) => json_response(StatusCode::OK, &json!({"ok": true, "id": id})),
        Ok(Insert::Duplicate(id)) if duplicate_ok => {
            json_response(StatusCode::OK, &json!({"ok": true, "id": id, "duplicate": true}))
        }
        Ok(Insert::Duplicate(_)) => error_response(StatusCode::BAD_REQUEST, "duplicate"),
        Err(e) => store_failure(e),
    }
}

fn change_response(result: Result<bool, StoreError>) -> HttpResponse {
    match result {
        Ok(true) => json_response(StatusCode::OK, &json!({"ok": true})),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => store_failure(e),
    }
}

/// Run a store operation on the blocking pool; every mutation writes the
/// store file while holding its lock.
async fn with_store<R, F>(store: &Arc<SinkStore>, op: F) -> Result<R, HttpResponse>
where
    F: FnOnce(&SinkStore) -> R + Send + 'static,
    R: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(&store)).await.map_err(|e| {
        error!(error = %e, "sink_store_task_failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_failed")
    })
}

async fn handle_list_post(
    req: Request<Incoming>,
    collection: Collection,
    store: &Arc<SinkStore>,
) -> Result<HttpResponse, HttpResponse> {
    let response = match collection {
        Collection::Messages => {
            let record = read_json::<DeliveryRecord>(req).await?;
            let serial = record.raspi_serial.clone();
            let result = with_store(store, move |s| s.insert_record(record)).await?;
            if let Ok(insert) = &result {
                debug!(serial = %serial, id = %insert.id(), duplicate = %insert.is_duplicate(), "record_received");
            }
            insert_response(result, true)
        }
        Collection::Gates => {
            let gate = read_json::<GateDefinition>(req).await?;
            insert_response(with_store(store, move |s| s.insert_gate(gate)).await?, false)
        }
        Collection::Events => {
            let event = read_json::<CrossingEvent>(req).await?;
            insert_response(with_store(store, move |s| s.insert_event(event)).await?, false)
        }
    };
    Ok(response)
}

async fn handle_item_put(
    req: Request<Incoming>,
    collection: Collection,
    id: u64,
    store: &Arc<SinkStore>,
) -> Result<HttpResponse, HttpResponse> {
    let result = match collection {
        Collection::Messages => {
            let record = read_json::<DeliveryRecord>(req).await?;
            with_store(store, move |s| s.update_record(id, record)).await?
        }
        Collection::Gates => {
            let gate = read_json::<GateDefinition>(req).await?;
            with_store(store, move |s| s.update_gate(id, gate)).await?
        }
        Collection::Events => {
            let event = read_json::<CrossingEvent>(req).await?;
            with_store(store, move |s| s.update_event(id, event)).await?
        }
    };
    Ok(change_response(result))
}

async fn handle_item_delete(
    collection: Collection,
    id: u64,
    store: &Arc<SinkStore>,
) -> Result<HttpResponse, HttpResponse> {
    let result = with_store(store, move |s| match collection {
        Collection::Messages => s.delete_record(id),
        Collection::Gates => s.delete_gate(id),
        Collection::Events => s.delete_event(id),
    })
    .await?;
    Ok(change_response(result))
}

async fn handle_list_get(
    collection: Collection,
    store: &Arc<SinkStore>,
) -> Result<HttpResponse, HttpResponse> {
    with_store(store, move |s| match collection {
        Collection::Messages => json_response(StatusCode::OK, &s.records()),
        Collection::Gates => json_response(StatusCode::OK, &s.gates()),
        Collection::Events => json_response(StatusCode::OK, &s.events()),
    })
    .await
}

async fn handle_collect(store: &Arc<SinkStore>) -> Result<HttpResponse, HttpResponse> {
    let response = match with_store(store, correlator::collect).await? {
        Ok(inserted) => json_response(StatusCode::OK, &json!({"ok": true, "inserted": inserted})),
        Err(e) => store_failure(e),
    };
    Ok(response)
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<Incoming>,
    store: Arc<SinkStore>,
) -> Result<HttpResponse, Infallible> {
    let route = parse_route(req.uri().path());
    let method = req.method().clone();

    let response = match (method, route) {
        (Method::GET, Route::Health) => Ok(json_response(StatusCode::OK, &json!({"ok": true}))),
        (Method::GET | Method::POST, Route::Collect) => handle_collect(&store).await,
        (Method::GET, Route::List(collection)) => handle_list_get(collection, &store).await,
        (Method::POST, Route::List(collection)) => handle_list_post(req, collection, &store).await,
        (Method::PUT, Route::Item(collection, id)) => {
            handle_item_put(req, collection, id, &store).await
        }
        (Method::DELETE, Route::Item(collection, id)) => {
            handle_item_delete(collection, id, &store).await
        }
        (_, Route::NotFound) => Err(error_response(StatusCode::NOT_FOUND, "not_found")),
        _ => Err(error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed")),
    };
    // error responses are ordinary replies
    Ok(response.unwrap_or_else(|response| response))
}

/// Start the sink HTTP server
pub async fn start_sink_server(
    port: u16,
    store: Arc<SinkStore>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    serve(listener, store, &mut shutdown).await;
    Ok(())
}

/// Accept loop on an already bound listener
pub async fn serve(listener: TcpListener, store: Arc<SinkStore>, shutdown: &mut watch::Receiver<bool>) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "sink_server_started");
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let store = store.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let store = store.clone();
                                async move { handle_request(req, store).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "sink_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "sink_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("sink_server_shutdown");
                    return;
                }
            }
        }
    }
}
