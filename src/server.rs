//! The stateful query-execution server: action dispatch plus the message
//! socket the gateway talks to.
//!
//! [`QueryServer`] is the single server-lifetime root owning the warehouse
//! handle, the cache, the state registry and the scheduler; everything
//! reaches shared state through it rather than through globals.

use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Result;
use crate::fingerprint::QueryId;
use crate::protocol::{Action, Reply, Request};
use crate::scheduler::Scheduler;
use crate::spec::QuerySpec;
use crate::state::{QueryState, StateRegistry};
use crate::warehouse::Warehouse;

/// The server-lifetime context.
pub struct QueryServer {
    pub warehouse: Arc<dyn Warehouse>,
    pub cache: Arc<Cache>,
    pub registry: Arc<StateRegistry>,
    pub scheduler: Scheduler,
}

impl QueryServer {
    /// Build the context: open (and reconcile) the cache, resolve the
    /// cache policy knobs (environment wins over the persisted
    /// `cache.cache_config`, and the resolved values are written back),
    /// and start the worker pool.
    pub async fn new(warehouse: Arc<dyn Warehouse>, config: &Config) -> Result<Arc<QueryServer>> {
        warehouse.ensure_cache_schema().await?;
        let persisted = warehouse.load_cache_config().await?;
        let persisted_f64 =
            |key: &str| persisted.get(key).and_then(|raw| raw.parse::<f64>().ok());

        let half_life = config
            .cache_half_life_seconds
            .or_else(|| persisted_f64("cache_half_life"))
            .unwrap_or(86_400.0);
        let size_limit = config
            .cache_size_limit_bytes
            .or_else(|| persisted_f64("cache_size_limit").map(|v| v as i64));

        warehouse
            .store_cache_config("cache_half_life", &half_life.to_string())
            .await?;
        if let Some(limit) = size_limit {
            warehouse
                .store_cache_config("cache_size_limit", &limit.to_string())
                .await?;
        }

        let cache = Arc::new(Cache::open(warehouse.clone(), half_life, size_limit).await?);
        let registry = Arc::new(StateRegistry::new());
        let scheduler = Scheduler::start(
            warehouse.clone(),
            cache.clone(),
            registry.clone(),
            config.worker_pool_size,
            config.ready_queue_depth,
        );
        Ok(Arc::new(QueryServer {
            warehouse,
            cache,
            registry,
            scheduler,
        }))
    }

    /// Accept gateway connections forever. Each connection carries one
    /// request at a time; replies go back on the same line-delimited
    /// stream.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            info!("connection from {peer}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!("connection from {peer} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = self.handle_line(&line).await;
            let mut encoded = serde_json::to_string(&reply)?;
            encoded.push('\n');
            write.write_all(encoded.as_bytes()).await?;
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> Reply {
        // Recover the request id before strict parsing so even a malformed
        // request gets a correlatable error reply.
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => return Reply::error("", format!("invalid JSON: {e}"), Value::Null),
        };
        let request_id = value
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        match serde_json::from_value::<Request>(value) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => Reply::error(&request_id, format!("invalid request: {e}"), Value::Null),
        }
    }

    /// Dispatch one request. Never fails: every error becomes an error
    /// envelope.
    pub async fn handle_request(&self, request: Request) -> Reply {
        match request.action {
            Action::RunQuery => self.run_query(&request).await,
            Action::PollQuery => self.poll_query(&request),
            Action::GetSqlForQueryResult => self.get_sql_for_query_result(&request).await,
            Action::GetQueryParams => self.get_query_params(&request),
            Action::GetQueryKind => self.get_query_kind(&request),
            Action::CancelQuery => self.cancel_query(&request),
        }
    }

    async fn run_query(&self, request: &Request) -> Reply {
        let spec = match QuerySpec::from_value(&request.params) {
            Ok(spec) => spec,
            Err(e) => return Reply::error(&request.request_id, e.to_string(), Value::Null),
        };
        if let Err(e) = spec.validate() {
            return Reply::error(&request.request_id, e.to_string(), Value::Null);
        }
        match self.scheduler.submit(spec).await {
            Ok(id) => Reply::accepted(&request.request_id, &id),
            Err(e) => Reply::error(&request.request_id, e.to_string(), Value::Null),
        }
    }

    fn poll_query(&self, request: &Request) -> Reply {
        let id = match request.query_id() {
            Ok(id) => id,
            Err(e) => return Reply::error(&request.request_id, e.to_string(), Value::Null),
        };
        match self.resolve_state(&id) {
            None => awol(request, &id),
            Some((state, cause)) => Reply {
                request_id: request.request_id.clone(),
                status: crate::protocol::ReplyStatus::Done,
                msg: cause.unwrap_or_default(),
                data: json!({ "query_id": id, "query_state": state }),
            },
        }
    }

    async fn get_sql_for_query_result(&self, request: &Request) -> Reply {
        let id = match request.query_id() {
            Ok(id) => id,
            Err(e) => return Reply::error(&request.request_id, e.to_string(), Value::Null),
        };
        match self.resolve_state(&id) {
            None => awol(request, &id),
            Some((QueryState::Completed, _)) => {
                let target = self.cache.lookup(&id).and_then(|record| {
                    Some((record.schema?, record.tablename?))
                });
                match target {
                    Some((schema, table)) => {
                        if let Err(e) = self.cache.touch(&id).await {
                            warn!("touch of {id} failed: {e}");
                        }
                        Reply::done(
                            &request.request_id,
                            json!({
                                "query_id": id,
                                "sql": format!("SELECT * FROM {schema}.{table}"),
                            }),
                        )
                    }
                    // Completed in the state machine without a relation:
                    // the dummy kind, by design.
                    None => Reply::query_error(
                        &request.request_id,
                        format!("Query '{id}' has no stored result"),
                        QueryState::Known,
                    ),
                }
            }
            Some((state, cause)) => Reply::query_error(
                &request.request_id,
                cause.unwrap_or_else(|| format!("Query '{id}' is not completed (state: {state})")),
                state,
            ),
        }
    }

    fn get_query_params(&self, request: &Request) -> Reply {
        let id = match request.query_id() {
            Ok(id) => id,
            Err(e) => return Reply::error(&request.request_id, e.to_string(), Value::Null),
        };
        let Some(record) = self.cache.lookup(&id) else {
            return awol(request, &id);
        };
        let params: Value = match serde_json::from_str(&record.spec_json) {
            Ok(params) => params,
            Err(e) => {
                return Reply::error(
                    &request.request_id,
                    format!("stored spec for '{id}' is unreadable: {e}"),
                    Value::Null,
                )
            }
        };
        Reply::done(
            &request.request_id,
            json!({ "query_id": id, "query_params": params }),
        )
    }

    fn get_query_kind(&self, request: &Request) -> Reply {
        let id = match request.query_id() {
            Ok(id) => id,
            Err(e) => return Reply::error(&request.request_id, e.to_string(), Value::Null),
        };
        match self.cache.lookup(&id) {
            Some(record) => Reply::done(
                &request.request_id,
                json!({ "query_id": id, "query_kind": record.query_kind }),
            ),
            None => awol(request, &id),
        }
    }

    fn cancel_query(&self, request: &Request) -> Reply {
        let id = match request.query_id() {
            Ok(id) => id,
            Err(e) => return Reply::error(&request.request_id, e.to_string(), Value::Null),
        };
        if self.resolve_state(&id).is_none() {
            return awol(request, &id);
        }
        match self.scheduler.cancel(&id) {
            Ok(_) => Reply::done(&request.request_id, json!({})),
            Err(e) => {
                let state = self
                    .resolve_state(&id)
                    .map(|(state, _)| state)
                    .unwrap_or(QueryState::Awol);
                Reply::query_error(&request.request_id, e.to_string(), state)
            }
        }
    }

    /// The externally visible state of an id: live registry first, then
    /// the persistent record (materialised → completed, bare → known),
    /// then nothing at all.
    fn resolve_state(&self, id: &QueryId) -> Option<(QueryState, Option<String>)> {
        if let Some(machine) = self.registry.get(id) {
            return Some((machine.current(), machine.error_cause()));
        }
        let record = self.cache.lookup(id)?;
        if record.is_materialised() {
            Some((QueryState::Completed, None))
        } else {
            Some((QueryState::Known, None))
        }
    }
}

fn awol(request: &Request, id: &QueryId) -> Reply {
    Reply::query_error(
        &request.request_id,
        format!("Unknown query id: '{id}'"),
        QueryState::Awol,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReplyStatus;
    use crate::warehouse::MemoryWarehouse;
    use serde_json::json;
    use std::time::Duration;

    async fn server() -> (Arc<QueryServer>, Arc<MemoryWarehouse>) {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let config = Config {
            worker_pool_size: 2,
            cache_size_limit_bytes: None,
            cache_half_life_seconds: None,
            warehouse_dsn: String::new(),
            token_verifier_public_key: None,
            log_level: "debug".into(),
            server_addr: String::new(),
            gateway_addr: String::new(),
            ready_queue_depth: 64,
        };
        let server = QueryServer::new(warehouse.clone() as Arc<dyn Warehouse>, &config)
            .await
            .unwrap();
        (server, warehouse)
    }

    fn run_request(params: Value) -> Request {
        Request::new("DUMMY_ID", Action::RunQuery, params)
    }

    fn id_request(action: Action, id: &str) -> Request {
        Request::new("DUMMY_ID", action, json!({ "query_id": id }))
    }

    async fn run_and_wait(server: &QueryServer, params: Value) -> QueryId {
        let reply = server.handle_request(run_request(params)).await;
        assert_eq!(reply.status, ReplyStatus::Accepted, "{:?}", reply);
        let id = QueryId::from(reply.data["query_id"].as_str().unwrap());
        server
            .registry
            .get(&id)
            .expect("machine exists after accept")
            .wait_terminal()
            .await;
        id
    }

    fn dummy_params() -> Value {
        json!({"query_kind": "dummy_query", "dummy_param": "foobar"})
    }

    fn degree_params() -> Value {
        json!({
            "query_kind": "subscriber_degree",
            "start": "2016-01-01",
            "stop": "2016-01-07",
            "direction": "both",
        })
    }

    #[tokio::test]
    async fn run_then_poll_reaches_completed() {
        let (server, _) = server().await;
        let id = run_and_wait(&server, dummy_params()).await;
        let reply = server
            .handle_request(id_request(Action::PollQuery, id.as_str()))
            .await;
        assert_eq!(reply.status, ReplyStatus::Done);
        assert_eq!(reply.data["query_state"], "completed");
        assert_eq!(reply.data["query_id"], id.as_str());
    }

    #[tokio::test]
    async fn run_is_idempotent_on_query_id() {
        let (server, _) = server().await;
        let a = server.handle_request(run_request(dummy_params())).await;
        let b = server.handle_request(run_request(dummy_params())).await;
        assert_eq!(a.data["query_id"], b.data["query_id"]);
    }

    #[tokio::test]
    async fn validation_errors_create_no_state() {
        let (server, _) = server().await;
        let reply = server
            .handle_request(run_request(json!({"query_kind": "flux_capacitor"})))
            .await;
        assert_eq!(reply.status, ReplyStatus::Error);
        assert!(reply.msg.contains("flux_capacitor"));

        let missing = server
            .handle_request(run_request(json!({
                "query_kind": "subscriber_degree",
                "start": "2016-01-01",
            })))
            .await;
        assert_eq!(missing.status, ReplyStatus::Error);
    }

    #[tokio::test]
    async fn awol_envelope_matches_the_contract() {
        let (server, _) = server().await;
        let reply = server
            .handle_request(id_request(Action::PollQuery, "FOOBAR"))
            .await;
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.msg, "Unknown query id: 'FOOBAR'");
        assert_eq!(reply.data, json!({"query_state": "awol"}));
    }

    #[tokio::test]
    async fn get_query_kind_reply_shape() {
        let (server, _) = server().await;
        let id = run_and_wait(&server, dummy_params()).await;
        let reply = server
            .handle_request(id_request(Action::GetQueryKind, id.as_str()))
            .await;
        assert_eq!(reply.status, ReplyStatus::Done);
        assert_eq!(
            reply.data,
            json!({"query_id": id, "query_kind": "dummy_query"})
        );
    }

    #[tokio::test]
    async fn get_query_params_round_trips_the_fingerprint() {
        let (server, _) = server().await;
        let id = run_and_wait(&server, degree_params()).await;
        let reply = server
            .handle_request(id_request(Action::GetQueryParams, id.as_str()))
            .await;
        assert_eq!(reply.status, ReplyStatus::Done);
        let returned = QuerySpec::from_value(&reply.data["query_params"]).unwrap();
        assert_eq!(returned.fingerprint(), id);
    }

    #[tokio::test]
    async fn completed_query_hands_out_sql_and_touches() {
        let (server, _) = server().await;
        let id = run_and_wait(&server, degree_params()).await;
        let before = server.cache.lookup(&id).unwrap().access_count;
        let reply = server
            .handle_request(id_request(Action::GetSqlForQueryResult, id.as_str()))
            .await;
        assert_eq!(reply.status, ReplyStatus::Done);
        let sql = reply.data["sql"].as_str().unwrap();
        assert_eq!(sql, format!("SELECT * FROM cache.{}", id.table_name()));
        assert_eq!(server.cache.lookup(&id).unwrap().access_count, before + 1);
    }

    #[tokio::test]
    async fn sql_for_a_running_query_reports_its_state() {
        let (server, warehouse) = server().await;
        warehouse.set_create_delay(Duration::from_millis(200));
        let accepted = server.handle_request(run_request(degree_params())).await;
        let id = accepted.data["query_id"].as_str().unwrap().to_owned();
        let reply = server
            .handle_request(id_request(Action::GetSqlForQueryResult, &id))
            .await;
        assert_eq!(reply.status, ReplyStatus::Error);
        let state = reply.data["query_state"].as_str().unwrap();
        assert!(state == "queued" || state == "executing", "got {state}");
    }

    #[tokio::test]
    async fn cancel_query_is_observable_on_poll() {
        let (server, warehouse) = server().await;
        warehouse.set_create_delay(Duration::from_millis(200));
        let accepted = server.handle_request(run_request(degree_params())).await;
        let id = QueryId::from(accepted.data["query_id"].as_str().unwrap());

        let reply = server
            .handle_request(id_request(Action::CancelQuery, id.as_str()))
            .await;
        assert_eq!(reply.status, ReplyStatus::Done);

        server.registry.get(&id).unwrap().wait_terminal().await;
        let poll = server
            .handle_request(id_request(Action::PollQuery, id.as_str()))
            .await;
        assert_eq!(poll.data["query_state"], "cancelled");
    }

    #[tokio::test]
    async fn errored_queries_surface_their_cause_on_poll() {
        let (server, warehouse) = server().await;
        warehouse.push_create_error(crate::error::Error::Warehouse(sqlx::Error::Protocol(
            "column \"recharge_amount\" does not exist".into(),
        )));
        let id = run_and_wait(
            &server,
            json!({
                "query_kind": "topup_amount",
                "start": "2016-01-01",
                "stop": "2016-01-07",
                "statistic": "sum",
            }),
        )
        .await;
        let poll = server
            .handle_request(id_request(Action::PollQuery, id.as_str()))
            .await;
        assert_eq!(poll.data["query_state"], "errored");
        assert!(poll.msg.contains("recharge_amount"));
    }
}
