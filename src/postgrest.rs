//! `SessionStore` over a PostgREST-style REST endpoint (e.g. Supabase).
//!
//! - `GET /rest/v1/{table}?select=session_id,messages,updated_at&order=updated_at.desc`
//! - `GET /rest/v1/{table}?select=messages,user_ip&session_id=eq.{id}` as a single object
//! - `GET /rest/v1/{table}?...&updated_at=gte.{ts}&order=updated_at.asc`

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::store::{SessionDetail, SessionRow, SessionStore, StoreError};

const LIST_COLUMNS: &str = "session_id,messages,updated_at";
const DETAIL_COLUMNS: &str = "messages,user_ip";
/// Makes PostgREST answer with one object, or 406 unless exactly one row matches
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PostgrestStore {
    client: reqwest::Client,
    table_url: String,
    api_key: Option<String>,
}

impl PostgrestStore {
    pub fn new(base_url: &str, table: &str, api_key: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            table_url: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            api_key,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        Self::new(&config.store_url, &config.table, config.store_key.clone())
    }

    fn get(&self, query: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}?{}", self.table_url, query));
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StoreError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl SessionStore for PostgrestStore {
    async fn fetch_sessions(&self) -> Result<Vec<SessionRow>, StoreError> {
        let query = format!("select={}&order=updated_at.desc", LIST_COLUMNS);
        let rows: Vec<SessionRow> = self.send(self.get(&query)).await?;
        debug!("Fetched {} session rows", rows.len());
        Ok(rows)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionDetail, StoreError> {
        let query = format!(
            "select={}&session_id=eq.{}",
            DETAIL_COLUMNS,
            urlencoding::encode(session_id)
        );
        let request = self.get(&query).header(reqwest::header::ACCEPT, SINGLE_OBJECT);
        match self.send(request).await {
            Err(StoreError::Status { status, .. }) if status == StatusCode::NOT_ACCEPTABLE.as_u16() => {
                Err(StoreError::NotFound(session_id.to_string()))
            }
            other => other,
        }
    }

    async fn fetch_changed_since(&self, since: Option<&str>) -> Result<Vec<SessionRow>, StoreError> {
        let mut query = format!("select={}&order=updated_at.asc", LIST_COLUMNS);
        if let Some(since) = since {
            query.push_str(&format!("&updated_at=gte.{}", urlencoding::encode(since)));
        }
        self.send(self.get(&query)).await
    }
}
