//! The stateless HTTP gateway.
//!
//! Owns token verification, request-id assignment, the multiplexed message
//! socket to the server (one outstanding exchange at a time, serialised
//! behind an async mutex) and the HTTP surface:
//!
//! | verb + path   | action                           | success            |
//! |---------------|----------------------------------|--------------------|
//! | `POST /run`   | `run_query`                      | 202 + Location     |
//! | `GET /poll/x` | `poll_query`                     | 303 / 202          |
//! | `GET /get/x`  | `get_sql_for_query_result` + SQL | 200 chunked JSON   |
//!
//! Result rows are streamed from the warehouse cursor straight into the
//! chunked response body; the full result is never buffered.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::claims::{Claims, Permission, TokenVerifier};
use crate::error::{Error, Result};
use crate::protocol::{Action, Reply, ReplyStatus, Request};
use crate::state::QueryState;
use crate::warehouse::Warehouse;

struct ServerConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// Gateway state shared across requests.
pub struct Gateway {
    connection: tokio::sync::Mutex<ServerConnection>,
    verifier: TokenVerifier,
    warehouse: Arc<dyn Warehouse>,
    next_request_id: AtomicU64,
}

impl Gateway {
    /// Dial the server's message socket.
    pub async fn connect(
        server_addr: &str,
        verifier: TokenVerifier,
        warehouse: Arc<dyn Warehouse>,
    ) -> Result<Arc<Gateway>> {
        let stream = TcpStream::connect(server_addr).await?;
        info!("gateway connected to server at {server_addr}");
        let (read, writer) = stream.into_split();
        Ok(Arc::new(Gateway {
            connection: tokio::sync::Mutex::new(ServerConnection {
                lines: BufReader::new(read).lines(),
                writer,
            }),
            verifier,
            warehouse,
            next_request_id: AtomicU64::new(1),
        }))
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/run", post(run))
            .route("/poll/:query_id", get(poll))
            .route("/get/:query_id", get(get_result))
            .with_state(self)
    }

    /// One request/reply exchange on the shared socket.
    async fn exchange(&self, action: Action, params: Value) -> Result<Reply> {
        let request_id = format!("req-{}", self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let request = Request::new(request_id.clone(), action, params);
        let mut encoded = serde_json::to_string(&request)?;
        encoded.push('\n');

        let mut connection = self.connection.lock().await;
        connection.writer.write_all(encoded.as_bytes()).await?;
        let line = connection
            .lines
            .next_line()
            .await?
            .ok_or_else(|| Error::Transport("server closed the socket".into()))?;
        let reply: Reply = serde_json::from_str(&line)
            .map_err(|e| Error::Transport(format!("unparseable reply: {e}")))?;
        if reply.request_id != request_id {
            return Err(Error::Transport(format!(
                "reply correlation mismatch: sent {request_id}, got {}",
                reply.request_id
            )));
        }
        debug!("exchange {action:?} -> {:?}", reply.status);
        Ok(reply)
    }

    fn claims(&self, headers: &HeaderMap) -> Result<Claims> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| Error::Forbidden("missing bearer token".into()))?;
        self.verifier.verify(token)
    }

    /// Claims check for an action on a given kind/unit. `Err` carries the
    /// ready-made 403.
    fn authorize(
        &self,
        headers: &HeaderMap,
        kind: &str,
        unit: Option<&str>,
        permission: Permission,
    ) -> std::result::Result<Claims, Response> {
        match self.claims(headers) {
            Ok(claims) if claims.allows(kind, permission, unit) => Ok(claims),
            Ok(claims) => {
                warn!(
                    "{} denied: no '{permission}' claim on {kind} ({unit:?})",
                    claims.identity
                );
                Err(forbidden("token does not grant this query"))
            }
            Err(e) => Err(forbidden(&e.to_string())),
        }
    }

    /// Resolve the kind and aggregation unit an id was submitted with, so
    /// id-addressed requests can be claims-checked. `None` means awol.
    async fn lookup_scope(&self, query_id: &str) -> Result<Option<(String, Option<String>)>> {
        let reply = self
            .exchange(Action::GetQueryParams, json!({ "query_id": query_id }))
            .await?;
        if reply.status == ReplyStatus::Error {
            return Ok(None);
        }
        let params = &reply.data["query_params"];
        let kind = params["query_kind"].as_str().unwrap_or_default().to_owned();
        let unit = params["aggregation_unit"].as_str().map(str::to_owned);
        Ok(Some((kind, unit)))
    }
}

async fn run(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let kind = body
        .get("query_kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let unit = body.get("aggregation_unit").and_then(Value::as_str);
    if let Err(denied) = gateway.authorize(&headers, &kind, unit, Permission::Run) {
        return denied;
    }
    match gateway.exchange(Action::RunQuery, body).await {
        Ok(reply) if reply.status == ReplyStatus::Accepted => {
            let query_id = reply.data["query_id"].as_str().unwrap_or_default().to_owned();
            json_response(
                StatusCode::ACCEPTED,
                json!({}),
                Some(("Location", format!("/poll/{query_id}"))),
            )
        }
        Ok(reply) => json_response(
            StatusCode::FORBIDDEN,
            json!({"status": "Error", "msg": reply.msg}),
            None,
        ),
        Err(e) => internal_error(e),
    }
}

async fn poll(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(query_id): Path<String>,
) -> Response {
    let scope = match gateway.lookup_scope(&query_id).await {
        Ok(Some(scope)) => scope,
        Ok(None) => return awol_response(&query_id),
        Err(e) => return internal_error(e),
    };
    if let Err(denied) = gateway.authorize(&headers, &scope.0, scope.1.as_deref(), Permission::Poll)
    {
        return denied;
    }
    let reply = match gateway
        .exchange(Action::PollQuery, json!({ "query_id": query_id }))
        .await
    {
        Ok(reply) => reply,
        Err(e) => return internal_error(e),
    };
    let state = reply.data["query_state"].as_str().unwrap_or("awol").to_owned();
    match state.as_str() {
        "completed" => json_response(
            StatusCode::SEE_OTHER,
            json!({}),
            Some(("Location", format!("/get/{query_id}"))),
        ),
        "queued" | "executing" => json_response(
            StatusCode::ACCEPTED,
            json!({"status": state, "msg": reply.msg}),
            None,
        ),
        "errored" | "cancelled" => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": state, "msg": reply.msg}),
            None,
        ),
        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({"status": state, "msg": reply.msg}),
            None,
        ),
    }
}

async fn get_result(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Path(query_id): Path<String>,
) -> Response {
    let scope = match gateway.lookup_scope(&query_id).await {
        Ok(Some(scope)) => scope,
        Ok(None) => return awol_response(&query_id),
        Err(e) => return internal_error(e),
    };
    if let Err(denied) =
        gateway.authorize(&headers, &scope.0, scope.1.as_deref(), Permission::GetResult)
    {
        return denied;
    }
    let reply = match gateway
        .exchange(Action::GetSqlForQueryResult, json!({ "query_id": query_id }))
        .await
    {
        Ok(reply) => reply,
        Err(e) => return internal_error(e),
    };
    if reply.status == ReplyStatus::Error {
        let state = reply.query_state().unwrap_or(QueryState::Awol);
        return match state {
            QueryState::Queued | QueryState::Executing => {
                json_response(StatusCode::ACCEPTED, json!({}), None)
            }
            QueryState::Errored => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"status": "Error", "msg": reply.msg}),
                None,
            ),
            _ => json_response(
                StatusCode::NOT_FOUND,
                json!({"status": "Error", "msg": reply.msg}),
                None,
            ),
        };
    }

    let sql = reply.data["sql"].as_str().unwrap_or_default().to_owned();
    let rows = match gateway.warehouse.stream_rows(&sql).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };

    // {"query_id": "...", "query_result": [row, row, ...]}, chunked.
    let head = stream::once(async move {
        Ok::<_, std::io::Error>(Bytes::from(format!(
            "{{\"query_id\":\"{query_id}\",\"query_result\":["
        )))
    });
    let body_rows = rows.enumerate().map(|(index, row)| {
        row.map(|value| {
            let separator = if index == 0 { "" } else { "," };
            Bytes::from(format!("{separator}{value}"))
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    });
    let tail = stream::once(async { Ok::<_, std::io::Error>(Bytes::from("]}")) });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_DISPOSITION, "attachment;filename=result.json")
        .body(Body::from_stream(head.chain(body_rows).chain(tail)))
        .unwrap_or_else(|e| internal_error(Error::Transport(e.to_string())))
}

fn json_response(
    status: StatusCode,
    body: Value,
    location: Option<(&'static str, String)>,
) -> Response {
    let mut response = (status, axum::Json(body)).into_response();
    if let Some((name, value)) = location {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

fn awol_response(query_id: &str) -> Response {
    json_response(
        StatusCode::NOT_FOUND,
        json!({
            "status": "error",
            "msg": format!("Unknown query id: '{query_id}'"),
            "data": {"query_state": "awol"},
        }),
        None,
    )
}

fn forbidden(msg: &str) -> Response {
    json_response(
        StatusCode::FORBIDDEN,
        json!({"status": "Error", "msg": msg}),
        None,
    )
}

fn internal_error(e: Error) -> Response {
    warn!("gateway internal error: {e}");
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"status": "Error", "msg": e.to_string()}),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn awol_body_matches_the_contract() {
        let response = awol_response("FOOBAR");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn forbidden_is_403() {
        assert_eq!(forbidden("nope").status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn location_header_is_attached() {
        let response = json_response(
            StatusCode::ACCEPTED,
            json!({}),
            Some(("Location", "/poll/abc".to_owned())),
        );
        assert_eq!(response.headers()["Location"], "/poll/abc");
    }
}
