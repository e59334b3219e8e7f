//! HTTP type conversions between hyper and the pool request types.

use std::net::IpAddr;

use anyhow::Context;
use bytes::Bytes;
use corral_instance::{Request, Response};
use http::Uri;
use http_body_util::{BodyExt, Full};

/// Convert an inbound hyper request into the pool request type, reading
/// the whole body into memory.
pub async fn request_from_hyper<B>(
    req: hyper::Request<B>,
    remote_addr: IpAddr,
) -> anyhow::Result<Request>
where
    B: hyper::body::Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .context("failed to read request body")?
        .to_bytes();
    Ok(Request {
        method: parts.method,
        path: uri_path_and_query(&parts.uri),
        headers: parts.headers,
        body,
        remote_addr,
        trusted: false,
        logged_in: false,
    })
}

/// Convert a pool response into a hyper response.
pub fn response_to_hyper(resp: Response) -> hyper::Response<Full<Bytes>> {
    let mut out = hyper::Response::new(Full::new(resp.body));
    *out.status_mut() = resp.status;
    *out.headers_mut() = resp.headers;
    out
}

/// Extract the path and query from a URI.
pub fn uri_path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}
