//! JSON RPC client
//!
//! The default client speaks line-delimited JSON over TCP: one request
//! object `{"method", "params", "id"}` per line, answered by one
//! `{"id", "result", "error"}` line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use apolo_core::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub address: String,
    pub transport: String,
    pub method: String,
    pub params: Value,
}

#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, request: &RpcRequest) -> AppResult<Value>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    method: &'a str,
    params: [&'a Value; 1],
    id: u64,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<Value>,
}

pub struct JsonTcpRpcClient {
    connect_timeout: Duration,
    reply_timeout: Duration,
    request_id: AtomicU64,
}

impl JsonTcpRpcClient {
    pub fn new(connect_timeout: Duration, reply_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            reply_timeout,
            request_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcClient for JsonTcpRpcClient {
    #[instrument(skip(self, request), fields(address = %request.address, method = %request.method))]
    async fn call(&self, request: &RpcRequest) -> AppResult<Value> {
        if !request.transport.is_empty() && request.transport != "*json" {
            return Err(AppError::Rpc(format!("unsupported transport {}", request.transport)));
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&request.address))
            .await
            .map_err(|_| AppError::Rpc(format!("connect to {} timed out", request.address)))?
            .map_err(|e| AppError::Rpc(format!("connect to {}: {}", request.address, e)))?;
        let (reader, mut writer) = stream.into_split();

        let id = self.next_id();
        let mut line = serde_json::to_vec(&WireRequest {
            method: &request.method,
            params: [&request.params],
            id,
        })?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(|e| AppError::Rpc(e.to_string()))?;
        debug!("RPC request {} sent", id);

        let mut reply = String::new();
        let mut reader = BufReader::new(reader);
        tokio::time::timeout(self.reply_timeout, reader.read_line(&mut reply))
            .await
            .map_err(|_| AppError::Rpc(format!("reply from {} timed out", request.address)))?
            .map_err(|e| AppError::Rpc(e.to_string()))?;

        let response: WireResponse = serde_json::from_str(reply.trim())
            .map_err(|e| AppError::Rpc(format!("bad reply: {}", e)))?;
        match response.error {
            Some(err) if !err.is_null() => Err(AppError::Rpc(err.to_string())),
            _ => Ok(response.result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_call_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let reply = serde_json::json!({"id": req["id"], "result": req["params"][0]["Name"], "error": null});
            writer
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        });

        let client = JsonTcpRpcClient::new(Duration::from_secs(1), Duration::from_secs(1));
        let result = client
            .call(&RpcRequest {
                address,
                transport: "*json".into(),
                method: "Accounts.Ping".into(),
                params: serde_json::json!({"Name": "rif"}),
            })
            .await
            .unwrap();
        assert_eq!(result, Value::String("rif".into()));
    }

    #[tokio::test]
    async fn test_unsupported_transport() {
        let client = JsonTcpRpcClient::new(Duration::from_secs(1), Duration::from_secs(1));
        let err = client
            .call(&RpcRequest {
                address: "127.0.0.1:1".into(),
                transport: "*gob".into(),
                method: "X".into(),
                params: Value::Null,
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "rpc_error");
    }
}
