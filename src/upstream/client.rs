//! CKAN datastore client for the open-data portal.

use crate::upstream::errors::UpstreamError;
use crate::upstream::json::parse_json_with_context;
use crate::upstream::models::{
    CkanResponse, DatasetMetadata, DatastoreResult, DatastoreTotal, Page, PageRequest, columns,
};
use crate::upstream::rate_limit::RateLimitMiddleware;
use crate::upstream::UpstreamSource;
use crate::utils::truncate_utf8;
use anyhow::Context;
use chrono_tz::Tz;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// How the portal formats `OCCURRED ON`, in Postgres `to_timestamp` notation.
const SOURCE_TIMESTAMP_FORMAT: &str = "MM/DD/YYYY HH24:MI";

/// Longest error body kept on a failed request.
const MAX_ERROR_BODY: usize = 512;

const USER_AGENT: &str = concat!("blotter/", env!("CARGO_PKG_VERSION"));

/// Connection settings for [`CkanApi`].
#[derive(Debug, Clone)]
pub struct CkanSettings {
    /// Action API root, e.g. `https://www.phoenixopendata.com/api/3/action/`.
    pub base_url: Url,
    pub resource_id: String,
    pub timeout: Duration,
    pub requests_per_minute: NonZeroU32,
    /// Zone the portal's naive timestamps are expressed in.
    pub source_timezone: Tz,
}

/// Paginated, rate-limited client for a single datastore resource.
pub struct CkanApi {
    http: ClientWithMiddleware,
    base_url: Url,
    resource_id: String,
    source_timezone: Tz,
}

impl CkanApi {
    pub fn new(settings: CkanSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::from_client(settings, client))
    }

    /// Wrap an already-configured client with the rate limiter.
    pub fn from_client(settings: CkanSettings, client: reqwest::Client) -> Self {
        let http = ClientBuilder::new(client)
            .with(RateLimitMiddleware::per_minute(settings.requests_per_minute))
            .build();

        // `Url::join` drops the last segment unless the base ends with a slash.
        let mut base_url = settings.base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            http,
            base_url,
            resource_id: settings.resource_id,
            source_timezone: settings.source_timezone,
        }
    }

    /// Rows currently in the resource, as the portal counts them.
    pub async fn record_count(&self) -> Result<u64, UpstreamError> {
        let result: DatastoreTotal = self
            .get_json(
                "datastore_search",
                &[("resource_id", self.resource_id.as_str()), ("limit", "0")],
            )
            .await?;
        Ok(result.total)
    }

    /// SQL for one page: timestamp filter, deterministic ordering, one extra
    /// row to learn whether another page follows.
    pub fn page_sql(&self, request: &PageRequest) -> String {
        let occurred = format!(
            r#"to_timestamp(NULLIF("{}", ''), '{SOURCE_TIMESTAMP_FORMAT}')::timestamp"#,
            columns::OCCURRED_ON
        );

        let mut sql = format!(r#"SELECT * FROM "{}""#, self.resource_id);
        if let Some(since) = request.since {
            let local = since
                .with_timezone(&self.source_timezone)
                .format("%Y-%m-%d %H:%M:%S");
            sql.push_str(&format!(" WHERE {occurred} >= '{local}'::timestamp"));
        }
        sql.push_str(&format!(
            r#" ORDER BY {occurred} ASC, "{key}" ASC LIMIT {limit} OFFSET {offset}"#,
            key = columns::NATURAL_KEY,
            limit = u64::from(request.limit) + 1,
            offset = request.offset,
        ));
        sql
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        action: &str,
        query: &[(&str, &str)],
    ) -> Result<T, UpstreamError> {
        let url = self
            .base_url
            .join(action)
            .map_err(|e| UpstreamError::Rejected(format!("invalid action URL: {e}")))?;

        let response = self.http.get(url.clone()).query(query).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate_utf8(body, MAX_ERROR_BODY),
            });
        }

        let envelope: CkanResponse<T> =
            parse_json_with_context(&body).map_err(|source| UpstreamError::ParseFailed {
                status: status.as_u16(),
                url: url.to_string(),
                source,
            })?;
        envelope.into_result().map_err(UpstreamError::Rejected)
    }
}

#[async_trait::async_trait]
impl UpstreamSource for CkanApi {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, UpstreamError> {
        let sql = self.page_sql(request);
        trace!(sql = %sql, "datastore query");

        let result: DatastoreResult = self
            .get_json("datastore_search_sql", &[("sql", sql.as_str())])
            .await?;

        let mut records = result.records;
        let has_more = records.len() > request.limit as usize;
        records.truncate(request.limit as usize);

        debug!(
            offset = request.offset,
            records = records.len(),
            has_more,
            "fetched upstream page"
        );
        Ok(Page { records, has_more })
    }

    async fn metadata(&self) -> Result<DatasetMetadata, UpstreamError> {
        self.get_json("resource_show", &[("id", self.resource_id.as_str())])
            .await
    }
}
