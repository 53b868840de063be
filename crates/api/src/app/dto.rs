use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobgate_auth::LoginCredentials;

/// Body of `POST /rpc/{service}`.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<JsonValue>,
    /// Session credentials; absent for anonymous and super calls.
    #[serde(default)]
    pub auth: Option<LoginCredentials>,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub result: JsonValue,
}
