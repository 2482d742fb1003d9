// HTTP response utilities for JSON bodies with optional Brotli encoding
use async_compression::tokio::bufread::BrotliEncoder;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Response, StatusCode},
};
use serde::Serialize;
use tokio::io::AsyncReadExt;

/// Whether the client listed `br` in `Accept-Encoding`.
pub fn accepts_brotli(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|encoding| encoding.split(';').next().map(str::trim) == Some("br"))
}

pub async fn brotli_compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = BrotliEncoder::new(std::io::Cursor::new(bytes));
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).await?;
    Ok(compressed)
}

/// Serialize `data` as JSON, Brotli-compressed when `compress` is set.
pub async fn json_response<T: Serialize>(
    status: StatusCode,
    data: &T,
    compress: bool,
) -> Result<Response<Body>, StatusCode> {
    let json = serde_json::to_vec(data).map_err(|e| {
        tracing::error!("JSON serialization error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let (body, content_encoding) = if compress {
        let compressed = brotli_compress(&json).await.map_err(|e| {
            tracing::error!("Brotli compression error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        tracing::debug!("Compressed {} -> {} bytes", json.len(), compressed.len());
        (compressed, Some("br"))
    } else {
        (json, None)
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    if let Some(encoding) = content_encoding {
        response = response.header(header::CONTENT_ENCODING, encoding);
    }

    response.body(Body::from(body)).map_err(|e| {
        tracing::error!("Response build error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::bufread::BrotliDecoder;
    use serde_json::json;

    #[test]
    fn test_accepts_brotli() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_brotli(&headers));

        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, br;q=0.9"));
        assert!(accepts_brotli(&headers));

        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, brotli-ish"));
        assert!(!accepts_brotli(&headers));
    }

    #[tokio::test]
    async fn test_compressed_body_decodes_back() {
        let data = json!({"widgets": [{"title": "Prices"}], "theme": "dark"});
        let response = json_response(StatusCode::OK, &data, true).await.unwrap();

        assert_eq!(response.headers()[header::CONTENT_ENCODING], "br");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

        let mut decoder = BrotliDecoder::new(std::io::Cursor::new(body.to_vec()));
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain).await.unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&plain).unwrap(), data);
    }

    #[tokio::test]
    async fn test_plain_body_has_no_encoding_header() {
        let response = json_response(StatusCode::CREATED, &json!({"ok": true}), false).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    }
}
