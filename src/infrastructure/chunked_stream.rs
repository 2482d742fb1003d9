// Chunked envelope streaming - length-prefixed JSON frames over a chunked HTTP body
use crate::domain::envelope::{self, Envelope};
use crate::infrastructure::http_response::brotli_compress;
use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::Stream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn chunked_envelope_stream<S>(stream: S, compress: bool) -> Result<Response<Body>, StatusCode>
where
    S: Stream<Item = Arc<Envelope>> + Send + 'static,
{
    let byte_stream = stream.then(move |envelope| async move { serialize_chunk(&envelope, compress).await });

    // Chunks are compressed one by one, so no Content-Encoding on the response.
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(byte_stream))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// One frame: 4-byte big-endian length, then the (optionally Brotli) JSON envelope.
pub async fn serialize_chunk(envelope: &Envelope, compress: bool) -> Result<Bytes, std::io::Error> {
    let json = envelope::encode(envelope).map_err(std::io::Error::other)?.into_bytes();

    let payload = if compress { brotli_compress(&json).await? } else { json };

    let length = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::other("frame larger than 4 GiB"))?;
    let mut chunk = BytesMut::with_capacity(4 + payload.len());
    chunk.put_u32(length);
    chunk.put_slice(&payload);

    Ok(chunk.freeze())
}

/// Stream envelopes from a subscription queue until it closes. `guard` is held
/// for the life of the body, so dropping the response releases it.
pub async fn stream_from_receiver<G>(
    mut rx: mpsc::UnboundedReceiver<Arc<Envelope>>,
    guard: G,
    compress: bool,
) -> impl IntoResponse
where
    G: Send + 'static,
{
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(envelope) = rx.recv().await {
            yield envelope;
        }
    };

    match chunked_envelope_stream(stream, compress).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}
