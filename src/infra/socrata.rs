use crate::config::Config;
use crate::constants::SOURCE_ORDER;
use crate::error::{PipelineError, Result};
use crate::types::{RawRecord, RecordSource};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::future::Future;
use tracing::{debug, instrument, warn};

/// Socrata system column used as an ordering tie-breaker so offset paging
/// doesn't skip or repeat rows sharing a `last_updated` value.
const ROW_ID_TIEBREAK: &str = ":id";
const APP_TOKEN_HEADER: &str = "X-App-Token";

/// Anonymous SODA client for one dataset.
pub struct SocrataSource {
    client: reqwest::Client,
    domain: String,
    dataset_id: String,
    app_token: Option<String>,
    page_size: usize,
}

impl SocrataSource {
    pub fn new(domain: impl Into<String>, dataset_id: impl Into<String>, page_size: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            domain: domain.into(),
            dataset_id: dataset_id.into(),
            app_token: None,
            page_size: page_size.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let source = Self::new(
            config.socrata_domain.clone(),
            config.socrata_dataset_id.clone(),
            config.page_size,
        );
        match &config.socrata_app_token {
            Some(token) => source.with_app_token(token.clone()),
            None => source,
        }
    }

    pub fn with_app_token(mut self, token: impl Into<String>) -> Self {
        self.app_token = Some(token.into());
        self
    }

    /// `https://{domain}/resource/{dataset}.json`; a domain that already
    /// carries a scheme is used as given.
    pub fn resource_url(&self) -> String {
        let base = if self.domain.starts_with("http://") || self.domain.starts_with("https://") {
            self.domain.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.domain.trim_end_matches('/'))
        };
        format!("{}/resource/{}.json", base, self.dataset_id)
    }

    #[instrument(skip(self))]
    async fn fetch_page(&self, limit: usize, offset: usize) -> Result<Page> {
        let mut request = self
            .client
            .get(self.resource_url())
            .header(ACCEPT, "application/json")
            .query(&page_params(limit, offset));
        if let Some(token) = &self.app_token {
            request = request.header(APP_TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Api {
                message: format!(
                    "Socrata returned {} for {}: {}",
                    status.as_u16(),
                    self.dataset_id,
                    excerpt(&body)
                ),
            });
        }

        let body: Value = response.json().await?;
        let page = decode_page(body)?;
        debug!(
            "Fetched page of {} records ({} items) at offset {}",
            page.records.len(),
            page.items,
            offset
        );
        Ok(page)
    }
}

#[async_trait]
impl RecordSource for SocrataSource {
    fn source_name(&self) -> String {
        format!("{}/{}", self.domain, self.dataset_id)
    }

    async fn fetch_records(&self, limit: usize) -> Result<Vec<RawRecord>> {
        collect_pages(limit, self.page_size, |page_limit, offset| {
            self.fetch_page(page_limit, offset)
        })
        .await
    }
}

/// One decoded response. `items` counts every array element the source
/// returned, including ones skipped during decoding; paging advances by it.
#[derive(Debug, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub items: usize,
}

/// Query parameters for one page.
pub fn page_params(limit: usize, offset: usize) -> Vec<(&'static str, String)> {
    vec![
        ("$limit", limit.to_string()),
        ("$offset", offset.to_string()),
        ("$order", format!("{SOURCE_ORDER},{ROW_ID_TIEBREAK}")),
    ]
}

/// Requests pages of at most `page_size` until `limit` records are collected
/// or the source returns a short page.
pub async fn collect_pages<F, Fut>(
    limit: usize,
    page_size: usize,
    mut fetch_page: F,
) -> Result<Vec<RawRecord>>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Page>>,
{
    let page_size = page_size.max(1);
    let mut records = Vec::new();
    let mut offset = 0;

    while records.len() < limit {
        let page_limit = page_size.min(limit - records.len());
        let Page {
            records: mut page,
            items,
        } = fetch_page(page_limit, offset).await?;
        offset += items;
        page.truncate(limit - records.len());
        records.append(&mut page);
        if items < page_limit {
            break;
        }
    }

    Ok(records)
}

/// SODA JSON responses are arrays of flat objects.
pub fn decode_page(body: Value) -> Result<Page> {
    let items = match body {
        Value::Array(items) => items,
        other => {
            return Err(PipelineError::Api {
                message: format!(
                    "expected a JSON array from Socrata, got {}",
                    excerpt(&other.to_string())
                ),
            })
        }
    };

    let mut page = Page {
        records: Vec::with_capacity(items.len()),
        items: items.len(),
    };
    for item in items {
        match item {
            Value::Object(map) => page.records.push(map),
            other => warn!("Skipping non-object record: {}", excerpt(&other.to_string())),
        }
    }
    Ok(page)
}

fn excerpt(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    fn page(n: usize) -> Page {
        Page {
            records: (0..n)
                .map(|i| json!({ "reported_issue": i.to_string() }).as_object().cloned().unwrap())
                .collect(),
            items: n,
        }
    }

    #[test]
    fn builds_resource_url_and_params() {
        let source = SocrataSource::new("data.kcmo.org", "d4px-6rwg", 50_000);
        assert_eq!(source.resource_url(), "https://data.kcmo.org/resource/d4px-6rwg.json");
        assert_eq!(source.source_name(), "data.kcmo.org/d4px-6rwg");

        let local = SocrataSource::new("http://127.0.0.1:8080/", "abcd-1234", 10);
        assert_eq!(local.resource_url(), "http://127.0.0.1:8080/resource/abcd-1234.json");

        let params = page_params(500, 1000);
        assert_eq!(params[0], ("$limit", "500".to_string()));
        assert_eq!(params[1], ("$offset", "1000".to_string()));
        assert_eq!(params[2], ("$order", "last_updated DESC,:id".to_string()));
    }

    #[tokio::test]
    async fn pages_until_limit() {
        let calls = RefCell::new(Vec::new());
        let records = collect_pages(25, 10, |limit, offset| {
            calls.borrow_mut().push((limit, offset));
            async move { Ok(page(limit)) }
        })
        .await
        .unwrap();

        assert_eq!(records.len(), 25);
        assert_eq!(*calls.borrow(), vec![(10, 0), (10, 10), (5, 20)]);
    }

    #[tokio::test]
    async fn stops_on_short_page() {
        let calls = RefCell::new(0);
        let records = collect_pages(100, 10, |limit, offset| {
            *calls.borrow_mut() += 1;
            let n = if offset == 0 { limit } else { 3 };
            async move { Ok(page(n)) }
        })
        .await
        .unwrap();

        assert_eq!(records.len(), 13);
        assert_eq!(*calls.borrow(), 2);
    }

    #[tokio::test]
    async fn skipped_items_neither_end_paging_nor_shift_offsets() {
        // 40 rows upstream; the fourth is a stray null
        let upstream: Vec<Value> = (0..40)
            .map(|i| {
                if i == 3 {
                    Value::Null
                } else {
                    json!({ "reported_issue": format!("R{i}") })
                }
            })
            .collect();
        let calls = RefCell::new(Vec::new());

        let records = collect_pages(25, 10, |limit, offset| {
            calls.borrow_mut().push((limit, offset));
            let end = (offset + limit).min(upstream.len());
            let body = Value::Array(upstream[offset..end].to_vec());
            async move { decode_page(body) }
        })
        .await
        .unwrap();

        assert_eq!(*calls.borrow(), vec![(10, 0), (10, 10), (6, 20)]);
        let ids: Vec<&str> = records
            .iter()
            .filter_map(|r| r["reported_issue"].as_str())
            .collect();
        let expected: Vec<String> = (0..26).filter(|i| *i != 3).map(|i| format!("R{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn page_errors_abort_the_fetch() {
        let result = collect_pages(100, 10, |_, offset| async move {
            if offset == 0 {
                Ok(page(10))
            } else {
                Err(PipelineError::Api {
                    message: "429 Too Many Requests".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Api { .. })));
    }

    #[test]
    fn decodes_arrays_and_skips_non_objects() {
        let page =
            decode_page(json!([{"reported_issue": "A"}, 5, {"reported_issue": "B"}])).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.items, 3);
        assert!(decode_page(json!({"error": true})).is_err());
    }
}
