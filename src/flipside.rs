//! Client for the Flipside query engine. Queries are submitted as SQL through the v2 JSON-RPC
//! API, polled until they finish, and their results read back one page at a time.

use std::time::Duration;

use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use format_url::FormatUrl;
use mockall::automock;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub const FLIPSIDE_API_URL: &str = "https://api-v2.flipsidecrypto.xyz";

const QUERY_STATE_SUCCESS: &str = "QUERY_STATE_SUCCESS";
const QUERY_STATE_FAILED: &str = "QUERY_STATE_FAILED";
const QUERY_STATE_CANCELED: &str = "QUERY_STATE_CANCELED";

/// One result row, column name to value.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHandle {
    pub query_id: String,
    pub total_row_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultPage {
    pub page_number: u32,
    pub records: Vec<Record>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("request to query service failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("query service responded with status {0}")]
    Status(StatusCode),
    #[error("query service returned error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("query run {query_id} ended in state {state}: {message}")]
    RunFailed {
        query_id: String,
        state: String,
        message: String,
    },
    #[error("query run {query_id} did not finish within {minutes} minutes")]
    Timeout { query_id: String, minutes: u32 },
    #[error("unexpected response from query service: {0}")]
    UnexpectedResponse(String),
}

impl QueryError {
    /// Network trouble, rate limiting and server side errors are worth retrying, everything
    /// else will fail the same way again. JSON-RPC error objects are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            QueryError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            QueryError::Status(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            QueryError::Rpc { .. }
            | QueryError::RunFailed { .. }
            | QueryError::Timeout { .. }
            | QueryError::UnexpectedResponse(_) => false,
        }
    }
}

#[automock]
#[async_trait]
pub trait QueryClient {
    /// Submits `sql` and waits for the run to finish.
    async fn query(&self, sql: &str) -> Result<QueryHandle, QueryError>;

    /// Fetches a single 1-based page of a finished query run.
    async fn get_query_results(
        &self,
        query_id: &str,
        page_number: u32,
        page_size: u32,
    ) -> Result<ResultPage, QueryError>;
}

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    method: &'a str,
    params: [P; 1],
    id: u32,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcError>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateQueryRunParams<'a> {
    result_ttl_hours: u32,
    max_age_minutes: u32,
    sql: &'a str,
    data_source: &'static str,
    data_provider: &'static str,
    timeout_minutes: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRunParams<'a> {
    query_run_id: &'a str,
}

#[derive(Serialize)]
struct PageParams {
    number: u32,
    size: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRunResultsParams<'a> {
    query_run_id: &'a str,
    format: &'static str,
    page: PageParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRun {
    id: String,
    state: String,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRunEnvelope {
    query_run: QueryRun,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultsPageInfo {
    current_page_number: u32,
    total_rows: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRunResults {
    column_names: Option<Vec<String>>,
    rows: Option<Vec<Vec<Value>>>,
    page: ResultsPageInfo,
}

impl QueryRunResults {
    fn into_records(self) -> Result<Vec<Record>, QueryError> {
        let rows = self.rows.unwrap_or_default();
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let column_names = self.column_names.ok_or_else(|| {
            QueryError::UnexpectedResponse("result rows without column names".to_string())
        })?;

        rows.into_iter()
            .map(|row| {
                if row.len() != column_names.len() {
                    return Err(QueryError::UnexpectedResponse(format!(
                        "row has {} values for {} columns",
                        row.len(),
                        column_names.len()
                    )));
                }

                Ok(column_names
                    .iter()
                    .map(|name| name.to_lowercase())
                    .zip(row)
                    .collect::<Record>())
            })
            .collect()
    }
}

pub struct FlipsideHttp {
    api_key: String,
    api_url: String,
    client: reqwest::Client,
    poll_interval: Duration,
    poll_retry_max_elapsed: Duration,
    timeout_minutes: u32,
}

impl FlipsideHttp {
    pub fn new(api_key: &str) -> Self {
        Self::new_with_url(api_key, FLIPSIDE_API_URL)
    }

    pub fn new_with_url(api_key: &str, api_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            poll_interval: Duration::from_secs(1),
            poll_retry_max_elapsed: Duration::from_secs(120),
            timeout_minutes: 20,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long a status poll keeps retrying transient errors before the run is abandoned.
    pub fn with_poll_retry_max_elapsed(mut self, poll_retry_max_elapsed: Duration) -> Self {
        self.poll_retry_max_elapsed = poll_retry_max_elapsed;
        self
    }

    pub fn with_timeout_minutes(mut self, timeout_minutes: u32) -> Self {
        self.timeout_minutes = timeout_minutes;
        self
    }

    async fn call<P, R>(&self, method: &str, params: P) -> Result<R, QueryError>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let url = FormatUrl::new(&self.api_url)
            .with_path_template("/json-rpc")
            .format_url();

        trace!(method, "calling query service");

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .json(&RpcRequest {
                jsonrpc: "2.0",
                method,
                params: [params],
                id: 1,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status(status));
        }

        let body = response.json::<RpcResponse<R>>().await?;

        match (body.result, body.error) {
            (_, Some(RpcError { code, message })) => Err(QueryError::Rpc { code, message }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(QueryError::UnexpectedResponse(format!(
                "{method} returned neither result nor error"
            ))),
        }
    }

    async fn create_query_run(&self, sql: &str) -> Result<QueryRun, QueryError> {
        let params = CreateQueryRunParams {
            result_ttl_hours: 1,
            max_age_minutes: 0,
            sql,
            data_source: "snowflake-default",
            data_provider: "flipside",
            timeout_minutes: self.timeout_minutes,
        };

        self.call::<_, QueryRunEnvelope>("createQueryRun", params)
            .await
            .map(|envelope| envelope.query_run)
    }

    async fn get_query_run(&self, query_id: &str) -> Result<QueryRun, QueryError> {
        self.call::<_, QueryRunEnvelope>(
            "getQueryRun",
            QueryRunParams {
                query_run_id: query_id,
            },
        )
        .await
        .map(|envelope| envelope.query_run)
    }

    fn poll_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.poll_interval)
            .with_max_elapsed_time(Some(self.poll_retry_max_elapsed))
            .build()
    }

    /// One status poll, retrying transient errors so a hiccup doesn't throw away a long run.
    async fn poll_query_run(&self, query_id: &str) -> Result<QueryRun, QueryError> {
        backoff::future::retry(self.poll_backoff(), || async {
            self.get_query_run(query_id).await.map_err(|err| {
                if err.is_transient() {
                    warn!(%err, query_id, "transient error polling query run, retrying");
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        })
        .await
    }

    async fn wait_for_query_run(&self, query_id: &str) -> Result<(), QueryError> {
        let deadline =
            Instant::now() + Duration::from_secs(u64::from(self.timeout_minutes) * 60);

        loop {
            let query_run = self.poll_query_run(query_id).await?;
            debug!(query_id, state = query_run.state, "polled query run");

            match query_run.state.as_str() {
                QUERY_STATE_SUCCESS => return Ok(()),
                QUERY_STATE_FAILED | QUERY_STATE_CANCELED => {
                    return Err(QueryError::RunFailed {
                        query_id: query_id.to_string(),
                        state: query_run.state,
                        message: query_run.error_message.unwrap_or_default(),
                    })
                }
                _ => (),
            }

            if Instant::now() >= deadline {
                return Err(QueryError::Timeout {
                    query_id: query_id.to_string(),
                    minutes: self.timeout_minutes,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn get_query_run_results(
        &self,
        query_id: &str,
        page_number: u32,
        page_size: u32,
    ) -> Result<QueryRunResults, QueryError> {
        self.call(
            "getQueryRunResults",
            QueryRunResultsParams {
                query_run_id: query_id,
                format: "json",
                page: PageParams {
                    number: page_number,
                    size: page_size,
                },
            },
        )
        .await
    }
}

#[async_trait]
impl QueryClient for FlipsideHttp {
    async fn query(&self, sql: &str) -> Result<QueryHandle, QueryError> {
        let query_run = self.create_query_run(sql).await?;
        debug!(query_id = query_run.id, "submitted query run");

        self.wait_for_query_run(&query_run.id).await?;

        // A single-row page is enough to learn the size of the full result set.
        let results = self.get_query_run_results(&query_run.id, 1, 1).await?;

        Ok(QueryHandle {
            query_id: query_run.id,
            total_row_count: results.page.total_rows,
        })
    }

    async fn get_query_results(
        &self,
        query_id: &str,
        page_number: u32,
        page_size: u32,
    ) -> Result<ResultPage, QueryError> {
        let results = self
            .get_query_run_results(query_id, page_number, page_size)
            .await?;
        let page_number = results.page.current_page_number;

        Ok(ResultPage {
            page_number,
            records: results.into_records()?,
        })
    }
}
