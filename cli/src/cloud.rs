use anyhow::{Context, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};

use buzz_core::cloud::{CloudError, CloudStore};
use buzz_core::models::{Intake, Settings};
use buzz_core::normalize::{normalize_intakes, normalize_settings};

use crate::server::USER_HEADER;

/// [`CloudStore`] backed by a `buzz serve` instance.
///
/// Calls block on the runtime captured at construction, so they must be made
/// from a blocking context (`block_in_place` or `spawn_blocking`).
pub struct HttpCloud {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    user: Option<String>,
    rt: tokio::runtime::Handle,
}

impl HttpCloud {
    pub fn new(base_url: &str, api_key: Option<String>, user: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "buzz-cli/{} (caffeine tracker)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(std::time::Duration::from_secs(10))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            user,
            rt: tokio::runtime::Handle::current(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}/api{path}", self.base_url));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(ref user) = self.user {
            req = req.header(USER_HEADER, user);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, CloudError> {
        let resp = req
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = resp
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| status.to_string());
        Err(status_error(status, detail))
    }

    async fn json(&self, req: RequestBuilder) -> Result<Value, CloudError> {
        self.send(req)
            .await?
            .json()
            .await
            .map_err(|e| CloudError::Rejected(format!("unreadable response: {e}")))
    }

    async fn list_all_async(&self) -> Result<Option<Vec<Intake>>, CloudError> {
        let body = self.json(self.request(Method::GET, "/intakes")).await?;
        Ok(intakes_field(&body))
    }

    async fn add_async(&self, intake: &Intake) -> Result<Option<String>, CloudError> {
        let body = self
            .json(self.request(Method::POST, "/intakes").json(intake))
            .await?;
        Ok(body
            .get("cloudId")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn remove_async(&self, client_id: &str) -> Result<bool, CloudError> {
        let path = format!("/intakes/{}", encode_segment(client_id));
        let body = self.json(self.request(Method::DELETE, &path)).await?;
        Ok(body.get("removed").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn upsert_async(&self, intake: &Intake) -> Result<(), CloudError> {
        let path = format!("/intakes/{}", encode_segment(&intake.client_id));
        self.send(self.request(Method::PUT, &path).json(intake))
            .await?;
        Ok(())
    }

    async fn list_removed_async(&self) -> Result<Option<Vec<String>>, CloudError> {
        let body = self
            .json(self.request(Method::GET, "/intakes/removed"))
            .await?;
        Ok(body.get("clientIds").and_then(Value::as_array).map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        }))
    }

    async fn merge_async(&self, local: &[Intake]) -> Result<Option<Vec<Intake>>, CloudError> {
        let body = self
            .json(
                self.request(Method::POST, "/intakes/merge")
                    .json(&json!({ "intakes": local })),
            )
            .await?;
        Ok(intakes_field(&body))
    }

    async fn get_settings_async(&self) -> Result<Option<Settings>, CloudError> {
        let body = self.json(self.request(Method::GET, "/settings")).await?;
        Ok((!body.is_null()).then(|| normalize_settings(&body)))
    }

    async fn save_settings_async(&self, settings: &Settings) -> Result<(), CloudError> {
        self.send(self.request(Method::PUT, "/settings").json(settings))
            .await?;
        Ok(())
    }
}

impl CloudStore for HttpCloud {
    fn list_all(&self) -> Result<Option<Vec<Intake>>, CloudError> {
        self.rt.block_on(self.list_all_async())
    }

    fn add(&self, intake: &Intake) -> Result<Option<String>, CloudError> {
        self.rt.block_on(self.add_async(intake))
    }

    fn remove(&self, client_id: &str) -> Result<bool, CloudError> {
        self.rt.block_on(self.remove_async(client_id))
    }

    fn upsert_intake(&self, intake: &Intake) -> Result<(), CloudError> {
        self.rt.block_on(self.upsert_async(intake))
    }

    fn list_removed(&self) -> Result<Option<Vec<String>>, CloudError> {
        self.rt.block_on(self.list_removed_async())
    }

    fn merge_from_local(&self, local: &[Intake]) -> Result<Option<Vec<Intake>>, CloudError> {
        self.rt.block_on(self.merge_async(local))
    }

    fn get_settings(&self) -> Result<Option<Settings>, CloudError> {
        self.rt.block_on(self.get_settings_async())
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), CloudError> {
        self.rt.block_on(self.save_settings_async(settings))
    }
}

fn status_error(status: StatusCode, detail: String) -> CloudError {
    match status {
        StatusCode::UNAUTHORIZED => CloudError::NotAuthenticated,
        StatusCode::FORBIDDEN => CloudError::NotAuthorized,
        _ => CloudError::Rejected(format!("{}: {detail}", status.as_u16())),
    }
}

// `null` is the server's "no identity" answer; anything else is repaired.
fn intakes_field(body: &Value) -> Option<Vec<Intake>> {
    match body.get("intakes") {
        None | Some(Value::Null) => None,
        Some(list) => Some(normalize_intakes(list)),
    }
}

// Client ids are uuids in practice, but imported logs can carry anything.
fn encode_segment(segment: &str) -> String {
    segment
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}
