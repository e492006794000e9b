use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::channel::RequestChannel;
use crate::error::{is_unavailable_status, ChannelError};
use crate::types::{FunctionPath, RemoteCall};

#[derive(Debug, Serialize)]
struct CallBody<'a> {
    path: &'a FunctionPath,
    args: &'a Value,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum CallResponse {
    Success {
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_message: String,
    },
}

/// Stateless JSON-over-HTTP channel. Always available, never pushes.
pub struct HttpChannel {
    client: Client,
    base_url: String,
}

impl HttpChannel {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn endpoint(&self, call: &RemoteCall) -> String {
        format!("{}/api/{}", self.base_url, call.kind)
    }
}

#[async_trait]
impl RequestChannel for HttpChannel {
    async fn call(&self, call: &RemoteCall) -> Result<Value, ChannelError> {
        let url = self.endpoint(call);
        debug!(%url, path = %call.path, "secondary call");

        let resp = self
            .client
            .post(&url)
            .json(&CallBody {
                path: &call.path,
                args: &call.args,
                format: "json",
            })
            .send()
            .await?;

        let status = resp.status();
        if is_unavailable_status(status.as_u16()) {
            return Err(ChannelError::Unavailable(status.to_string()));
        }

        let body = resp.bytes().await?;
        match serde_json::from_slice::<CallResponse>(&body) {
            Ok(CallResponse::Success { value }) => Ok(value),
            Ok(CallResponse::Error { error_message }) => Err(ChannelError::remote(error_message)),
            Err(_) if !status.is_success() => Err(ChannelError::Rejected(format!(
                "{status}: {}",
                String::from_utf8_lossy(&body)
            ))),
            Err(e) => Err(ChannelError::Serialization(e)),
        }
    }
}
