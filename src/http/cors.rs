//! CORS origin echo, mirroring `tushandlers.go`'s `customizedCors`: the
//! `Origin` header is echoed back verbatim only when it appears in the
//! configured allow-list, and `Vary: Origin` is always set so caches don't
//! serve one origin's response to another.

use hyper::header::{HeaderMap, HeaderValue};

pub fn apply(headers: &mut HeaderMap, request_origin: Option<&str>, allowed_origins: &[String]) {
    headers.insert("Vary", HeaderValue::from_static("Origin"));

    let Some(origin) = request_origin else { return };
    let allowed = allowed_origins.iter().any(|o| o == "*" || o == origin);
    if !allowed {
        return;
    }

    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert("Access-Control-Allow-Origin", value);
    }
    headers.insert("Access-Control-Allow-Credentials", HeaderValue::from_static("true"));
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Tus-Resumable,Upload-Length,Upload-Metadata,Upload-Offset,Upload-Defer-Length,Upload-Concat,Content-Type"),
    );
    headers.insert(
        "Access-Control-Expose-Headers",
        HeaderValue::from_static("Tus-Resumable,Upload-Length,Upload-Offset,Upload-Defer-Length,Upload-Concat,Location"),
    );
    headers.insert("Access-Control-Allow-Methods", HeaderValue::from_static("POST,HEAD,PATCH,DELETE,GET,OPTIONS"));
}
