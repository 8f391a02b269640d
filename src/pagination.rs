//! Reads every row of a finished query run by walking its result pages in order.

use std::{num::NonZeroU32, time::Duration};

use backoff::{self, ExponentialBackoff, ExponentialBackoffBuilder};
use pit_wall::Progress;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::flipside::{QueryClient, QueryError, QueryHandle, Record, ResultPage};

#[derive(Debug, Clone)]
pub struct PaginationOptions {
    /// Operator tuned. Too large and the query service errors, there is no automatic back-off.
    pub page_size: NonZeroU32,
    pub retry_initial_interval: Duration,
    pub max_retry_elapsed: Duration,
}

impl PaginationOptions {
    pub fn new(page_size: NonZeroU32) -> Self {
        Self {
            page_size,
            retry_initial_interval: Duration::from_millis(500),
            max_retry_elapsed: Duration::from_secs(120),
        }
    }

    pub fn with_retry_timing(
        mut self,
        retry_initial_interval: Duration,
        max_retry_elapsed: Duration,
    ) -> Self {
        self.retry_initial_interval = retry_initial_interval;
        self.max_retry_elapsed = max_retry_elapsed;
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_initial_interval)
            .with_max_elapsed_time(Some(self.max_retry_elapsed))
            .build()
    }
}

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("failed to fetch page {page_number} of {page_count} for query {query_id}")]
    Page {
        query_id: String,
        page_number: u32,
        page_count: u32,
        #[source]
        source: QueryError,
    },
    #[error("query {query_id} has {total_row_count} rows, too many pages of {page_size} rows")]
    TooManyPages {
        query_id: String,
        total_row_count: u64,
        page_size: NonZeroU32,
    },
    #[error("query {query_id} reported {expected} rows but its pages held {actual}")]
    RowCountMismatch {
        query_id: String,
        expected: u64,
        actual: u64,
    },
}

/// Number of pages needed to read `total_row_count` rows. An empty result still takes one page
/// request.
pub fn page_count(total_row_count: u64, page_size: NonZeroU32) -> u64 {
    let page_size = u64::from(page_size.get());
    let pages = total_row_count / page_size + u64::from(total_row_count % page_size != 0);
    pages.max(1)
}

async fn fetch_page<C>(
    client: &C,
    query_id: &str,
    page_number: u32,
    options: &PaginationOptions,
) -> Result<ResultPage, QueryError>
where
    C: QueryClient + ?Sized,
{
    backoff::future::retry(options.backoff(), || async {
        client
            .get_query_results(query_id, page_number, options.page_size.get())
            .await
            .map_err(|err| {
                if err.is_transient() {
                    warn!(%err, query_id, page_number, "transient error fetching page, retrying");
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
    })
    .await
}

/// Requests pages `1..=page_count` one after the other and concatenates their records in page
/// order. Transient page failures are retried with exponential backoff, anything else aborts
/// the whole run.
pub async fn fetch_all<C>(
    client: &C,
    handle: &QueryHandle,
    options: &PaginationOptions,
) -> Result<Vec<Record>, PaginationError>
where
    C: QueryClient + ?Sized,
{
    let query_id = handle.query_id.as_str();
    let page_count = u32::try_from(page_count(handle.total_row_count, options.page_size))
        .map_err(|_| PaginationError::TooManyPages {
            query_id: query_id.to_string(),
            total_row_count: handle.total_row_count,
            page_size: options.page_size,
        })?;

    debug!(
        query_id,
        total_row_count = handle.total_row_count,
        page_size = options.page_size.get(),
        page_count,
        "fetching all result pages"
    );

    let mut progress = Progress::new("fetch query result pages", page_count.into());
    let mut records = Vec::with_capacity(usize::try_from(handle.total_row_count).unwrap_or(0));

    for page_number in 1..=page_count {
        let page = fetch_page(client, query_id, page_number, options)
            .await
            .map_err(|source| PaginationError::Page {
                query_id: query_id.to_string(),
                page_number,
                page_count,
                source,
            })?;

        if page.records.is_empty() {
            debug!(query_id, page_number, "empty result page, skipping");
        } else {
            records.extend(page.records);
        }

        progress.inc_work_done();
        info!("{}", progress.get_progress_string());
    }

    let actual = records.len() as u64;
    if actual != handle.total_row_count {
        return Err(PaginationError::RowCountMismatch {
            query_id: query_id.to_string(),
            expected: handle.total_row_count,
            actual,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use mockall::Sequence;
    use serde_json::json;

    use super::*;
    use reqwest::StatusCode;

    use crate::flipside::MockQueryClient;

    fn record(n: u64) -> Record {
        let mut record = Record::new();
        record.insert("n".to_string(), json!(n));
        record
    }

    /// Serves `total` numbered rows the way the query service pages them.
    fn page_of(total: u64, page_number: u32, page_size: u32) -> ResultPage {
        let start = u64::from(page_number - 1) * u64::from(page_size);
        let end = (start + u64::from(page_size)).min(total);
        ResultPage {
            page_number,
            records: (start..end).map(record).collect(),
        }
    }

    fn handle(total_row_count: u64) -> QueryHandle {
        QueryHandle {
            query_id: "query-1".to_string(),
            total_row_count,
        }
    }

    fn options(page_size: u32) -> PaginationOptions {
        PaginationOptions::new(NonZeroU32::new(page_size).unwrap())
            .with_retry_timing(Duration::from_millis(1), Duration::from_millis(200))
    }

    #[test]
    fn page_count_test() {
        let ten = NonZeroU32::new(10).unwrap();
        assert_eq!(page_count(0, ten), 1);
        assert_eq!(page_count(1, ten), 1);
        assert_eq!(page_count(10, ten), 1);
        assert_eq!(page_count(11, ten), 2);
        assert_eq!(page_count(100, ten), 10);
        assert_eq!(page_count(101, ten), 11);
    }

    #[tokio::test]
    async fn requests_pages_in_order_and_concatenates_test() {
        let mut client = MockQueryClient::new();
        let mut seq = Sequence::new();

        for expected_page in 1..=3u32 {
            client
                .expect_get_query_results()
                .withf(move |query_id: &str, page_number: &u32, page_size: &u32| {
                    query_id == "query-1" && *page_number == expected_page && *page_size == 2
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, page_number, page_size| Ok(page_of(5, page_number, page_size)));
        }

        let records = fetch_all(&client, &handle(5), &options(2)).await.unwrap();

        let ns: Vec<_> = records.iter().map(|record| record["n"].clone()).collect();
        assert_eq!(ns, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn exact_page_boundary_test() {
        let mut client = MockQueryClient::new();
        client
            .expect_get_query_results()
            .times(4)
            .returning(|_, page_number, page_size| Ok(page_of(100, page_number, page_size)));

        let records = fetch_all(&client, &handle(100), &options(25)).await.unwrap();

        assert_eq!(records.len(), 100);
    }

    #[tokio::test]
    async fn zero_rows_still_requests_one_page_test() {
        let mut client = MockQueryClient::new();
        client
            .expect_get_query_results()
            .times(1)
            .returning(|_, page_number, _| {
                Ok(ResultPage {
                    page_number,
                    records: vec![],
                })
            });

        let records = fetch_all(&client, &handle(0), &options(10_000))
            .await
            .unwrap();

        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn empty_page_is_skipped_test() {
        let mut client = MockQueryClient::new();
        client
            .expect_get_query_results()
            .times(2)
            .returning(|_, page_number, _| {
                let records = if page_number == 1 {
                    vec![record(0), record(1)]
                } else {
                    vec![]
                };
                Ok(ResultPage {
                    page_number,
                    records,
                })
            });

        // Two rows reported, but a page size of 1 makes the service answer page 2 empty.
        let result = fetch_all(&client, &handle(2), &options(1)).await.unwrap();

        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn missing_rows_are_a_row_count_mismatch_test() {
        let mut client = MockQueryClient::new();
        client
            .expect_get_query_results()
            .times(2)
            .returning(|_, page_number, page_size| Ok(page_of(15, page_number, page_size)));

        let err = fetch_all(&client, &handle(20), &options(10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PaginationError::RowCountMismatch {
                expected: 20,
                actual: 15,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transient_error_is_retried_test() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_mock = calls.clone();

        let mut client = MockQueryClient::new();
        client
            .expect_get_query_results()
            .returning(move |_, page_number, page_size| {
                if calls_in_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(QueryError::Status(StatusCode::SERVICE_UNAVAILABLE))
                } else {
                    Ok(page_of(3, page_number, page_size))
                }
            });

        let records = fetch_all(&client, &handle(3), &options(10)).await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_error_aborts_test() {
        let mut client = MockQueryClient::new();
        let mut seq = Sequence::new();
        client
            .expect_get_query_results()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, page_number, page_size| Ok(page_of(30, page_number, page_size)));
        client
            .expect_get_query_results()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| {
                Err(QueryError::Rpc {
                    code: -32602,
                    message: "invalid params".to_string(),
                })
            });

        let err = fetch_all(&client, &handle(30), &options(10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PaginationError::Page {
                page_number: 2,
                page_count: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rpc_error_object_is_not_retried_test() {
        let mut client = MockQueryClient::new();
        client
            .expect_get_query_results()
            .times(1)
            .returning(|_, _, _| {
                Err(QueryError::Rpc {
                    code: -32603,
                    message: "internal error".to_string(),
                })
            });

        let err = fetch_all(&client, &handle(5), &options(10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PaginationError::Page {
                page_number: 1,
                source: QueryError::Rpc { code: -32603, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn retries_give_up_after_budget_test() {
        let mut client = MockQueryClient::new();
        client
            .expect_get_query_results()
            .returning(|_, _, _| Err(QueryError::Status(StatusCode::BAD_GATEWAY)));

        let err = fetch_all(&client, &handle(1), &options(10))
            .await
            .unwrap_err();

        assert!(matches!(err, PaginationError::Page { page_number: 1, .. }));
    }
}
