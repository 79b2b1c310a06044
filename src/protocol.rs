//! The request/reply contract between the gateway and the server.
//!
//! One UTF-8 JSON object per line on a persistent socket; no further
//! framing. Every request carries an opaque `request_id` echoed verbatim in
//! the reply, so a multiplexing client can match replies to requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::fingerprint::QueryId;
use crate::state::QueryState;

/// The actions the server answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    RunQuery,
    PollQuery,
    GetSqlForQueryResult,
    GetQueryParams,
    GetQueryKind,
    CancelQuery,
}

/// The permission each action demands from the caller's claims.
impl Action {
    pub fn required_permission(&self) -> crate::claims::Permission {
        use crate::claims::Permission;
        match self {
            Action::RunQuery | Action::CancelQuery => Permission::Run,
            Action::PollQuery | Action::GetQueryParams | Action::GetQueryKind => Permission::Poll,
            Action::GetSqlForQueryResult => Permission::GetResult,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub action: Action,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(request_id: impl Into<String>, action: Action, params: Value) -> Self {
        Request {
            request_id: request_id.into(),
            action,
            params,
        }
    }

    /// The `query_id` parameter, for the actions that address one.
    pub fn query_id(&self) -> Result<QueryId> {
        self.params
            .get("query_id")
            .and_then(Value::as_str)
            .map(QueryId::from)
            .ok_or_else(|| Error::Validation("missing required parameter 'query_id'".into()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// `run_query` took the submission.
    Accepted,
    /// The action succeeded.
    Done,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub request_id: String,
    pub status: ReplyStatus,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Value,
}

impl Reply {
    pub fn accepted(request_id: &str, query_id: &QueryId) -> Reply {
        Reply {
            request_id: request_id.to_owned(),
            status: ReplyStatus::Accepted,
            msg: String::new(),
            data: serde_json::json!({ "query_id": query_id }),
        }
    }

    pub fn done(request_id: &str, data: Value) -> Reply {
        Reply {
            request_id: request_id.to_owned(),
            status: ReplyStatus::Done,
            msg: String::new(),
            data,
        }
    }

    pub fn error(request_id: &str, msg: impl Into<String>, data: Value) -> Reply {
        Reply {
            request_id: request_id.to_owned(),
            status: ReplyStatus::Error,
            msg: msg.into(),
            data,
        }
    }

    /// The error envelope for query-addressed failures: `msg` plus
    /// `data.query_state` so the gateway can map it to an HTTP status.
    pub fn query_error(
        request_id: &str,
        msg: impl Into<String>,
        state: QueryState,
    ) -> Reply {
        Reply::error(
            request_id,
            msg,
            serde_json::json!({ "query_state": state }),
        )
    }

    /// The state attached to an error reply, if any.
    pub fn query_state(&self) -> Option<QueryState> {
        serde_json::from_value(self.data.get("query_state")?.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let raw = json!({
            "request_id": "DUMMY_ID",
            "action": "run_query",
            "params": {"query_kind": "dummy_query", "dummy_param": "foobar"},
        });
        let request: Request = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(request.action, Action::RunQuery);
        assert_eq!(serde_json::to_value(&request).unwrap(), raw);
    }

    #[test]
    fn unknown_action_fails_to_parse() {
        let raw = json!({"request_id": "1", "action": "explode", "params": {}});
        assert!(serde_json::from_value::<Request>(raw).is_err());
    }

    #[test]
    fn awol_envelope_shape() {
        let reply = Reply::query_error(
            "REQ",
            "Unknown query id: 'FOOBAR'",
            QueryState::Awol,
        );
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["msg"], "Unknown query id: 'FOOBAR'");
        assert_eq!(value["data"]["query_state"], "awol");
    }

    #[test]
    fn reply_state_round_trips() {
        let reply = Reply::query_error("REQ", "", QueryState::Executing);
        assert_eq!(reply.query_state(), Some(QueryState::Executing));
        let none = Reply::done("REQ", json!({}));
        assert_eq!(none.query_state(), None);
    }
}
