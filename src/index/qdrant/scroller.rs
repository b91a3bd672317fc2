//! Streaming pagination over Qdrant's scroll endpoint.

use async_stream::try_stream;
use futures_core::Stream;
use reqwest::Method;
use serde_json::{Map, Value, json};

use super::client::QdrantService;
use super::types::{QdrantError, ScrollResponse};

/// Stream payloads of points matching `filter`, `page_size` points per request.
///
/// Pages are fetched lazily, so a consumer that stops early never requests the rest.
pub fn stream_payloads<'a>(
    service: &'a QdrantService,
    collection: &'a str,
    filter: Value,
    page_size: usize,
) -> impl Stream<Item = Result<Map<String, Value>, QdrantError>> + 'a {
    try_stream! {
        let mut offset = Value::Null;

        loop {
            let body = json!({
                "with_payload": true,
                "with_vector": false,
                "limit": page_size,
                "filter": filter.clone(),
                "offset": offset,
            });

            let response = service
                .request(Method::POST, &format!("collections/{collection}/points/scroll"))
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            let page: ScrollResponse = if status.is_success() {
                response.json().await?
            } else {
                let body = response.text().await.unwrap_or_default();
                tracing::error!(collection, status = %status, "Failed to scroll payloads");
                Err(QdrantError::UnexpectedStatus { status, body })?
            };

            let ScrollResponse { result } = page;
            for point in result.points {
                if let Some(payload) = point.payload {
                    yield payload;
                }
            }

            match result.next_page_offset {
                Some(next) if !next.is_null() => offset = next,
                _ => break,
            }
        }
    }
}
