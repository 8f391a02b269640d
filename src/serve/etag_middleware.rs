use axum::{
    body::HttpBody,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{BufMut, BytesMut};
use etag::EntityTag;
use tracing::{error, trace, warn};

/// Tags successful responses with a strong ETag over their body and answers 304 when the
/// client's `If-None-Match` already matches.
pub async fn middleware_fn<B>(req: Request<B>, next: Next<B>) -> Result<Response, StatusCode> {
    let if_none_match = req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let path = req.uri().path().to_owned();

    let (mut parts, mut body) = next.run(req).await.into_parts();

    let mut body_bytes = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|err| {
            error!(path, %err, "failed to read response body");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        body_bytes.put(chunk);
    }
    let bytes = body_bytes.freeze();

    if bytes.is_empty() || !parts.status.is_success() {
        trace!(path, status = %parts.status, "no cacheable body, skipping etag");
        return Ok((parts, bytes).into_response());
    }

    let etag = EntityTag::from_data(&bytes);
    let etag_value =
        HeaderValue::from_str(&etag.to_string()).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    parts.headers.insert(header::ETAG, etag_value);

    let client_etag = if_none_match.and_then(|value| match value.parse::<EntityTag>() {
        Ok(client_etag) => Some(client_etag),
        Err(err) => {
            warn!(path, %err, value, "unparsable if-none-match header");
            None
        }
    });

    match client_etag {
        Some(client_etag) if etag.strong_eq(&client_etag) => {
            trace!(path, %etag, "etag match, not modified");
            parts.status = StatusCode::NOT_MODIFIED;
            Ok((parts, ()).into_response())
        }
        _ => {
            trace!(path, %etag, "sending full response");
            Ok((parts, bytes).into_response())
        }
    }
}
