//! Route handlers for the data API.
//!
//! Each handler validates the encoding first, converts the wire body into
//! engine requests and delegates to [`ApiService`].

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tracing::{debug, warn};

use super::AppError;
use super::types::{
    EncodingQuery, GetValuesRequest, HealthResponse, MessagesResponse,
    SetValuesRequest, SetValuesResponse, SubscribeRequest, ValueEncoding, encode_batch,
};
use crate::error::Error;
use crate::hub::Subscription;
use crate::service::ApiService;
use crate::store::{GetRequest, KeyValue, SetRequest};

/// POST /v1/get - Resolve keys and prefixes.
pub(crate) async fn get_values(
    State(service): State<ApiService>,
    Query(query): Query<EncodingQuery>,
    Json(body): Json<GetValuesRequest>,
) -> Result<Json<MessagesResponse>, AppError> {
    let encoding = ValueEncoding::from_query(&query)?;
    let requests = body.requests.into_iter().map(GetRequest::from).collect();

    let found = service.get_values(requests).await?;
    Ok(Json(MessagesResponse {
        messages: encode_batch(&found, encoding)?,
    }))
}

/// POST /v1/set - Apply one atomic batch.
pub(crate) async fn set_values(
    State(service): State<ApiService>,
    Query(query): Query<EncodingQuery>,
    Json(body): Json<SetValuesRequest>,
) -> Result<Json<SetValuesResponse>, AppError> {
    let encoding = ValueEncoding::from_query(&query)?;

    let mut entries = Vec::with_capacity(body.messages.len());
    for message in body.messages {
        let value = encoding.decode(&message.key, message.value)?;
        entries.push(KeyValue::new(message.key, value));
    }
    let request = SetRequest {
        entries,
        ttl: body.ttl_ms.map(Duration::from_millis),
    };

    service.set_values(request).await?;
    Ok(Json(SetValuesResponse::default()))
}

/// POST /v1/subscribe - Stream the snapshot, then live batches, as NDJSON.
pub(crate) async fn subscribe(
    State(service): State<ApiService>,
    Query(query): Query<EncodingQuery>,
    Json(body): Json<SubscribeRequest>,
) -> Result<Response, AppError> {
    let encoding = ValueEncoding::from_query(&query)?;
    let prefixes = body.prefixes.into_iter().map(String::into_bytes).collect();

    let subscription = service.subscribe(prefixes).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(ndjson_lines(subscription, encoding)),
    )
        .into_response())
}

/// GET /health - Liveness check.
pub(crate) async fn health(State(service): State<ApiService>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        backend: service.store().backend_name().to_string(),
    })
}

/// One line per batch; a failed feed ends the stream with an error line.
fn ndjson_lines(
    subscription: Subscription,
    encoding: ValueEncoding,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    futures::stream::unfold(Some(subscription), move |state| async move {
        let mut subscription = state?;
        let batch = match subscription.next().await {
            Ok(batch) => batch,
            Err(err) => {
                debug!(subscription = subscription.id(), error = %err, "Subscription ended");
                return Some((Ok(error_line(&err)), None));
            },
        };
        match batch_line(&batch, encoding) {
            Ok(line) => Some((Ok(line), Some(subscription))),
            Err(err) => {
                warn!(subscription = subscription.id(), error = %err, "Ending subscription stream");
                Some((Ok(error_line(&err)), None))
            },
        }
    })
}

fn batch_line(batch: &[KeyValue], encoding: ValueEncoding) -> Result<Bytes, Error> {
    let messages = encode_batch(batch, encoding)?;
    to_line(&MessagesResponse { messages })
        .map_err(|e| Error::Internal(format!("serialize subscription batch: {e}")))
}

fn error_line(err: &Error) -> Bytes {
    let mut line = serde_json::json!({ "error": err.to_string() })
        .to_string()
        .into_bytes();
    line.push(b'\n');
    Bytes::from(line)
}

fn to_line<T: Serialize>(value: &T) -> serde_json::Result<Bytes> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}
