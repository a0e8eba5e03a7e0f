use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::core::AppConfig;
use crate::source::{CollectionKey, FetchError, Record, RecordApi};

/// Field requested when listing; the listing only needs identifiers but the
/// API wants at least one field.
const LISTING_FIELD: &str = "attachment";

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<ListedRecord>,
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedRecord {
    id: String,
}

/// Airtable REST client bound to a single base.
pub struct AirtableClient {
    client: reqwest::Client,
    api_url: String,
    base_id: String,
    api_key: Option<String>,
}

impl AirtableClient {
    pub fn new(
        api_url: impl Into<String>,
        base_id: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FetchError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            base_id: base_id.into(),
            api_key,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, FetchError> {
        let api_key = config.api_key();
        match &api_key {
            Some(key) => {
                let prefix: String = key.chars().take(8).collect();
                log::info!("Using Airtable API key: {}...", prefix);
            }
            None => {
                // Requests will fail individually with 401; the viewer still starts.
                log::error!("Airtable API key not found! Set {} or api_key in the config file.", config.api_key_env);
            }
        }

        Self::new(
            config.api_url.clone(),
            config.base_id.clone(),
            api_key,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.api_url, self.base_id, table)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, FetchError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RecordApi for AirtableClient {
    async fn list_ids(&self, collection: &CollectionKey) -> Result<Vec<String>, FetchError> {
        let url = self.table_url(&collection.table);
        let mut ids = Vec::new();
        let mut known = HashSet::new();
        let mut offset: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let mut query: Vec<(&str, &str)> = vec![
                ("view", collection.view.as_str()),
                ("fields[]", LISTING_FIELD),
            ];
            if let Some(ref cursor) = offset {
                query.push(("offset", cursor.as_str()));
            }

            let page: ListResponse = self.send_json(self.client.get(&url).query(&query)).await?;
            pages += 1;

            for record in page.records {
                if known.insert(record.id.clone()) {
                    ids.push(record.id);
                }
            }

            match page.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        log::debug!("Listed {} records from {} in {} page(s)", ids.len(), collection, pages);
        Ok(ids)
    }

    async fn get_record(&self, table: &str, id: &str) -> Result<Record, FetchError> {
        let url = format!("{}/{}", self.table_url(table), id);
        self.send_json(self.client.get(&url)).await
    }
}
