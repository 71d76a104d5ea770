//! The HTTP surface: a hand-rolled `hyper::service::Service` dispatch wired
//! directly from `hyper::Server` rather than through a web framework.

pub mod cors;
pub mod jwt;
pub mod proxy;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};

use crate::config::Settings;
use crate::error::AppError;
use crate::metadata;
use crate::protocol::{self, Protocol, RequestIdentity};

const MAX_BUFFERED_BODY: u64 = 64 * 1024 * 1024;

/// Safe-to-inline MIME types for the convenience GET route, mirroring
/// `mimeInlineBrowserWhitelist`; everything else is served as an
/// attachment so a browser never executes an uploaded HTML/SVG payload.
const INLINE_MIME_WHITELIST: &[&str] =
    &["image/png", "image/jpeg", "image/gif", "image/webp", "audio/wave", "audio/ogg", "video/webm", "text/plain", "application/pdf"];

pub struct AppState {
    pub protocol: Protocol,
    pub settings: Arc<Settings>,
}

/// Binds and serves until `shutdown` resolves. `started` fires once
/// `Server::bind` has succeeded and the listener is accepting connections,
/// not before.
pub async fn serve(
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    started: tokio::sync::oneshot::Sender<()>,
) -> Result<(), hyper::Error> {
    let addr: SocketAddr = state.settings.server.listen_address.parse().expect("listen_address must be a valid socket address");

    let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
        let state = state.clone();
        let peer = conn.remote_addr();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), peer, req))) }
    });

    let server = Server::bind(&addr).serve(make_svc);
    tracing::info!(%addr, "tusistor listening");
    let _ = started.send(());
    server.with_graceful_shutdown(shutdown).await
}

async fn handle(state: Arc<AppState>, peer: SocketAddr, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let origin = header_str(req.headers(), "origin").map(str::to_owned);
    let allowed_origins = state.settings.server.cors_origins.clone();

    let mut response = match route(&state, peer, req).await {
        Ok(resp) => resp,
        Err(err) => error_response(&err),
    };

    cors::apply(response.headers_mut(), origin.as_deref(), &allowed_origins);
    response.headers_mut().insert("Tus-Resumable", HeaderValue::from_static(protocol::TUS_VERSION));
    Ok(response)
}

async fn route(state: &AppState, peer: SocketAddr, req: Request<Body>) -> Result<Response<Body>, AppError> {
    if req.method() == Method::OPTIONS {
        return Ok(options_response(&state.settings));
    }

    let path = req.uri().path().to_owned();
    let base = state.settings.server.base_path.trim_end_matches('/');
    let Some(tail) = path.strip_prefix(base) else {
        return Err(AppError::NotFound);
    };
    let tail = tail.trim_start_matches('/');

    if req.method() != Method::POST && !tail.is_empty() {
        check_tus_resumable(req.headers())?;
    }

    match (req.method(), tail.is_empty()) {
        (&Method::GET, true) if tail.is_empty() && path.ends_with("configuration") => Ok(options_response(&state.settings)),
        (&Method::POST, true) => create(state, peer, req).await,
        (&Method::HEAD, false) => head(state, tail).await,
        (&Method::PATCH, false) => patch(state, peer, tail.to_owned(), req).await,
        (&Method::DELETE, false) => delete(state, peer, tail.to_owned(), req).await,
        (&Method::GET, false) => get(state, peer, tail.to_owned(), req).await,
        _ => Err(AppError::NotFound),
    }
}

fn check_tus_resumable(headers: &HeaderMap) -> Result<(), AppError> {
    match header_str(headers, "tus-resumable") {
        Some(v) if v == protocol::TUS_VERSION => Ok(()),
        _ => Err(AppError::BadRequest("unsupported or missing Tus-Resumable version".into())),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn identity_for(state: &AppState, peer: SocketAddr, headers: &HeaderMap) -> Result<RequestIdentity, AppError> {
    let forwarded = header_str(headers, "x-forwarded-for");
    let remote_ip = proxy::resolve_remote_ip(&state.settings, peer.ip(), forwarded)?;

    let token = header_str(headers, "upload-metadata").and_then(metadata::extract_extjwt);
    if let Some(token) = token {
        match jwt::verify(&state.settings, &token) {
            Ok(mut identity) => {
                identity.remote_ip = remote_ip;
                return Ok(identity);
            }
            Err(e) => {
                tracing::warn!(error = %e, "JWT verification failed, proceeding anonymously");
            }
        }
    }

    Ok(RequestIdentity { remote_ip, account: String::new(), issuer: String::new() })
}

async fn create(state: &AppState, peer: SocketAddr, req: Request<Body>) -> Result<Response<Body>, AppError> {
    check_tus_resumable(req.headers())?;
    let identity = identity_for(state, peer, req.headers()).await?;

    let upload_length = header_str(req.headers(), "upload-length").map(|v| v.parse::<u64>()).transpose().map_err(|_| AppError::BadRequest("malformed Upload-Length".into()))?;
    let defer_length = header_str(req.headers(), "upload-defer-length") == Some("1");
    let raw_metadata = header_str(req.headers(), "upload-metadata").map(str::to_owned);
    let upload_concat = header_str(req.headers(), "upload-concat").map(str::to_owned);

    let now = now_unix();
    let created = state
        .protocol
        .create_upload(upload_length, defer_length, raw_metadata.as_deref(), upload_concat.as_deref(), &identity, now)
        .await?;

    let location = format!("{}/{}", state.settings.server.base_path.trim_end_matches('/'), created.id);
    let mut response = Response::builder().status(StatusCode::CREATED).header("Location", location).body(Body::empty()).unwrap();
    if let Some(len) = created.upload_length {
        response.headers_mut().insert("Upload-Length", HeaderValue::from_str(&len.to_string()).unwrap());
    }
    Ok(response)
}

async fn head(state: &AppState, id: &str) -> Result<Response<Body>, AppError> {
    let info = state.protocol.head_upload(id).await?;

    let mut builder = Response::builder().status(StatusCode::OK).header("Cache-Control", "no-store").header("Upload-Offset", info.upload_offset.to_string());

    if let Some(len) = info.upload_length {
        builder = builder.header("Upload-Length", len.to_string());
    } else {
        builder = builder.header("Upload-Defer-Length", "1");
    }
    if !info.metadata.is_empty() {
        builder = builder.header("Upload-Metadata", metadata::serialize(&info.metadata));
    }
    if info.is_partial {
        builder = builder.header("Upload-Concat", "partial");
    }

    Ok(builder.body(Body::empty()).unwrap())
}

async fn patch(state: &AppState, peer: SocketAddr, id: String, req: Request<Body>) -> Result<Response<Body>, AppError> {
    let content_type_ok = header_str(req.headers(), "content-type") == Some("application/offset+octet-stream");
    if !content_type_ok {
        return Err(AppError::BadRequest("Content-Type must be application/offset+octet-stream".into()));
    }

    let identity = identity_for(state, peer, req.headers()).await?;

    let offset = header_str(req.headers(), "upload-offset")
        .ok_or_else(|| AppError::BadRequest("Upload-Offset header is required".into()))?
        .parse::<u64>()
        .map_err(|_| AppError::BadRequest("malformed Upload-Offset".into()))?;

    if let Some(length_header) = header_str(req.headers(), "upload-length") {
        let length: u64 = length_header.parse().map_err(|_| AppError::BadRequest("malformed Upload-Length".into()))?;
        state.protocol.set_upload_length(&id, length).await?;
    }

    let content_length = header_str(req.headers(), "content-length").and_then(|v| v.parse::<u64>().ok());
    if content_length.map(|len| len > MAX_BUFFERED_BODY).unwrap_or(false) {
        return Err(AppError::TooLarge);
    }

    let body = hyper::body::to_bytes(req.into_body()).await.map_err(|e| AppError::BadRequest(e.to_string()))?;
    let now = now_unix();
    let new_offset = state.protocol.write_chunk(&id, offset, content_length, &body, &identity, now).await?;

    Ok(Response::builder().status(StatusCode::NO_CONTENT).header("Upload-Offset", new_offset.to_string()).body(Body::empty()).unwrap())
}

async fn delete(state: &AppState, peer: SocketAddr, id: String, req: Request<Body>) -> Result<Response<Body>, AppError> {
    let identity = identity_for(state, peer, req.headers()).await?;
    state.protocol.delete_upload(&id, &identity).await?;
    Ok(Response::builder().status(StatusCode::NO_CONTENT).body(Body::empty()).unwrap())
}

/// Not part of tus core; a convenience direct-download route.
async fn get(state: &AppState, peer: SocketAddr, id: String, req: Request<Body>) -> Result<Response<Body>, AppError> {
    let identity = identity_for(state, peer, req.headers()).await?;
    let (info, path) = state.protocol.get_upload(&id, &identity).await?;

    let file_size = tokio::fs::metadata(&path).await?.len();
    let range = header_str(req.headers(), "range").map(|h| protocol::parse_range(h, file_size)).transpose();
    let range = match range {
        Ok(r) => r,
        Err(e) => {
            return Ok(Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header("Content-Range", format!("bytes */{file_size}"))
                .body(Body::from(e.to_string()))
                .unwrap())
        }
    };

    let filename = metadata::get_str(&info.metadata, "filename").unwrap_or("upload.bin").to_owned();
    let filetype = metadata::get_str(&info.metadata, "filetype").unwrap_or("application/octet-stream").to_owned();
    let disposition = if INLINE_MIME_WHITELIST.contains(&filetype.as_str()) {
        format!("inline; filename=\"{}\"", sanitize_filename(&filename))
    } else {
        format!("attachment; filename=\"{}\"", sanitize_filename(&filename))
    };

    let mut file = tokio::fs::File::open(&path).await?;
    let mut builder = Response::builder().header("Content-Type", filetype).header("Content-Disposition", disposition).header("Accept-Ranges", "bytes");

    let body = match range.flatten() {
        Some(r) => {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            file.seek(std::io::SeekFrom::Start(r.start)).await?;
            let len = (r.end_inclusive - r.start + 1) as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;
            builder = builder.status(StatusCode::PARTIAL_CONTENT).header("Content-Range", format!("bytes {}-{}/{}", r.start, r.end_inclusive, file_size));
            Body::from(buf)
        }
        None => {
            builder = builder.status(StatusCode::OK).header("Content-Length", file_size.to_string());
            let stream = tokio_util::io::ReaderStream::new(file);
            Body::wrap_stream(stream)
        }
    };

    Ok(builder.body(body).unwrap())
}

fn sanitize_filename(name: &str) -> String {
    name.replace('"', "")
}

fn options_response(settings: &Settings) -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Tus-Version", protocol::TUS_VERSION)
        .header("Tus-Extension", protocol::TUS_EXTENSIONS)
        .header(protocol::TUS_MAX_SIZE_HEADER, settings.storage.maximum_upload_size.to_string())
        .body(Body::empty())
        .unwrap()
}

fn error_response(err: &AppError) -> Response<Body> {
    crate::error::log_at(err.log_level(), err);
    let mut body = err.to_string();
    if let Some(tag) = err.tus_tag() {
        body = format!("{tag}: {body}");
    }
    Response::builder().status(err.status_code()).header("Content-Type", "text/plain; charset=utf-8").body(Body::from(body)).unwrap()
}

fn now_unix() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
