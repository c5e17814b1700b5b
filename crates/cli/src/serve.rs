//! Daemon mode – the handle-table surface as newline-delimited JSON over a
//! Unix socket.
//!
//! Request:  `{"id": "1", "method": "start", "params": {"settings": {...}}}`
//! Response: `{"id": "1", "result": {"handle": 1}}` or `{"id": "1", "error": {...}}`

use engine::HandleTable;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Deserialize)]
struct DaemonRequest {
    id: String,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct DaemonResponse {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize)]
struct ErrorInfo {
    code: &'static str,
    message: String,
}

impl DaemonResponse {
    fn ok(id: String, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: String, code: &'static str, message: String) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorInfo { code, message }),
        }
    }
}

pub async fn run_daemon(socket_path: PathBuf, table: Arc<HandleTable>) {
    // Remove stale socket if it exists
    let _ = std::fs::remove_file(&socket_path);

    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: cannot bind socket {}: {}", socket_path.display(), e);
            std::process::exit(2);
        }
    };

    tracing::info!(socket = %socket_path.display(), "nettaskctl daemon listening");
    eprintln!("nettaskctl daemon listening on {}", socket_path.display());

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::spawn(serve_connection(stream, Arc::clone(&table)));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
            }
        }
    }
}

async fn serve_connection(stream: UnixStream, table: Arc<HandleTable>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let response = handle_request(&line, &table).await;
        let mut resp_json = serde_json::to_string(&response).unwrap_or_else(|_| "{}".into());
        resp_json.push('\n');
        if writer.write_all(resp_json.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn handle_param(params: &Value) -> Result<u32, String> {
    params
        .get("handle")
        .and_then(Value::as_u64)
        .and_then(|h| u32::try_from(h).ok())
        .ok_or_else(|| "missing or invalid \"handle\"".to_string())
}

async fn handle_request(line: &str, table: &Arc<HandleTable>) -> DaemonResponse {
    let req: DaemonRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return DaemonResponse::err(
                "unknown".into(),
                "INVALID_INPUT",
                format!("invalid JSON request: {}", e),
            );
        }
    };
    tracing::debug!(id = %req.id, method = %req.method, "daemon request");

    let result = match req.method.as_str() {
        "list" => Ok(json!({ "nettests": table.engine().nettests().list() })),
        "start" => match req.params.get("settings") {
            // settings may be sent as a document or as its text
            Some(Value::String(text)) => Ok(json!({ "handle": table.start(Some(text.as_str())) })),
            Some(doc) if doc.is_object() => {
                Ok(json!({ "handle": table.start(Some(doc.to_string().as_str())) }))
            }
            _ => Err("missing \"settings\"".to_string()),
        },
        "wait_for_next_event" => match handle_param(&req.params) {
            Ok(handle) => {
                let table = Arc::clone(table);
                blocking(move || table.wait_for_next_event(handle))
                    .await
                    .map(|text| {
                        let event = serde_json::from_str(&text).unwrap_or(Value::String(text));
                        json!({ "event": event })
                    })
            }
            Err(e) => Err(e),
        },
        "is_done" => handle_param(&req.params).map(|h| json!({ "done": table.is_done(h) })),
        "interrupt" => handle_param(&req.params).map(|h| {
            table.interrupt(h);
            json!({})
        }),
        "destroy" => match handle_param(&req.params) {
            Ok(handle) => {
                let table = Arc::clone(table);
                blocking(move || table.destroy(handle)).await.map(|()| json!({}))
            }
            Err(e) => Err(e),
        },
        other => {
            return DaemonResponse::err(
                req.id,
                "UNKNOWN_METHOD",
                format!("unknown method: {}", other),
            );
        }
    };

    match result {
        Ok(value) => DaemonResponse::ok(req.id, value),
        Err(message) => DaemonResponse::err(req.id, "INVALID_INPUT", message),
    }
}

/// Task waits block their thread; keep them off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| format!("worker failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{EngineConfig, EngineContext};

    fn table() -> Arc<HandleTable> {
        Arc::new(HandleTable::new(EngineContext::default_platform(
            EngineConfig::default(),
        )))
    }

    async fn call(table: &Arc<HandleTable>, req: Value) -> Value {
        let resp = handle_request(&req.to_string(), table).await;
        serde_json::to_value(&resp).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let resp = handle_request("not json", &table()).await;
        assert_eq!(resp.id, "unknown");
        assert_eq!(resp.error.unwrap().code, "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let resp = call(&table(), json!({"id": "7", "method": "reboot"})).await;
        assert_eq!(resp["id"], "7");
        assert_eq!(resp["error"]["code"], "UNKNOWN_METHOD");
    }

    #[tokio::test]
    async fn test_list() {
        let resp = call(&table(), json!({"id": "1", "method": "list"})).await;
        assert_eq!(resp["result"]["nettests"], json!(["echo-nettest", "tcp_connect"]));
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let t = table();
        let resp = call(&t, json!({"id": "1", "method": "is_done", "params": {"handle": 9}})).await;
        assert_eq!(resp["result"]["done"], true);
        let resp = call(
            &t,
            json!({"id": "2", "method": "wait_for_next_event", "params": {"handle": 9}}),
        )
        .await;
        assert_eq!(resp["result"]["event"]["key"], "status.terminated");
        let resp = call(&t, json!({"id": "3", "method": "destroy", "params": {}})).await;
        assert_eq!(resp["error"]["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_start_and_drain_bad_settings() {
        let t = table();
        let resp = call(
            &t,
            json!({"id": "1", "method": "start", "params": {"settings": "{"}}),
        )
        .await;
        let handle = resp["result"]["handle"].as_u64().unwrap();
        assert!(handle > 0);

        let mut keys = Vec::new();
        loop {
            let resp = call(
                &t,
                json!({"id": "2", "method": "wait_for_next_event", "params": {"handle": handle}}),
            )
            .await;
            let key = resp["result"]["event"]["key"].as_str().unwrap().to_string();
            if key == "status.terminated" {
                break;
            }
            keys.push(key);
        }
        assert_eq!(keys, vec!["status.queued", "failure.startup", "status.end"]);

        let resp = call(&t, json!({"id": "3", "method": "destroy", "params": {"handle": handle}})).await;
        assert_eq!(resp["result"], json!({}));
        let resp = call(&t, json!({"id": "4", "method": "is_done", "params": {"handle": handle}})).await;
        assert_eq!(resp["result"]["done"], true);
    }
}
