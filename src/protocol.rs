//! the tus protocol state machine: translates parsed tus headers into
//! calls against the registry and blob store, independent of the HTTP
//! framing those headers arrived in. Mirrors `server/tusd-extracts.go`
//! and `tushandlers.go` for exact status/header semantics.

use std::sync::Arc;

use crate::config::Settings;
use crate::error::AppError;
use crate::events::EventBus;
use crate::metadata::{self, Metadata};
use crate::registry::UploadRegistry;
use crate::store::{BlobStore, UploadInfo};

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation,creation-defer-length,termination,concatenation";
pub const TUS_MAX_SIZE_HEADER: &str = "Tus-Max-Size";

/// Identity resolved for the current request by the HTTP layer (trusted
/// proxy IP resolution + optional JWT verification), passed down so the
/// protocol engine never touches headers directly.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub remote_ip: String,
    pub account: String,
    pub issuer: String,
}

pub struct Protocol {
    pub registry: Arc<dyn UploadRegistry>,
    pub store: Arc<BlobStore>,
    pub events: Arc<EventBus>,
    pub settings: Arc<Settings>,
}

pub struct CreatedUpload {
    pub id: String,
    pub upload_length: Option<u64>,
}

impl Protocol {
    /// POST /files — Creation (+ Creation-Defer-Length, + Concatenation).
    #[tracing::instrument(level = "debug", skip(self, raw_metadata))]
    pub async fn create_upload(
        &self,
        upload_length: Option<u64>,
        defer_length: bool,
        raw_metadata: Option<&str>,
        upload_concat: Option<&str>,
        identity: &RequestIdentity,
        now: i64,
    ) -> Result<CreatedUpload, AppError> {
        if upload_length.is_none() && !defer_length && upload_concat.is_none() {
            return Err(AppError::BadRequest("Upload-Length or Upload-Defer-Length is required".into()));
        }
        if let Some(len) = upload_length {
            if len > self.settings.storage.maximum_upload_size {
                return Err(AppError::TooLarge);
            }
        }
        if self.settings.server.require_jwt_account && identity.account.is_empty() {
            return Err(AppError::Unauthorized);
        }

        let meta = raw_metadata.map(metadata::parse).unwrap_or_default();
        let meta = metadata::sanitize(meta, &identity.remote_ip, &identity.account, &identity.issuer);

        if let Some(concat) = upload_concat {
            return self.create_concatenation(concat, meta, identity, now).await;
        }

        let is_partial = false;
        let id = self
            .store
            .create_upload(upload_length, meta, is_partial, &identity.remote_ip, &identity.account, &identity.issuer, now)
            .await?;

        Ok(CreatedUpload { id, upload_length })
    }

    async fn create_concatenation(
        &self,
        upload_concat: &str,
        meta: Metadata,
        identity: &RequestIdentity,
        now: i64,
    ) -> Result<CreatedUpload, AppError> {
        if let Some(rest) = upload_concat.strip_prefix("partial") {
            if !rest.is_empty() {
                return Err(AppError::BadRequest("malformed Upload-Concat header".into()));
            }
            let id = self.store.create_upload(None, meta, true, &identity.remote_ip, &identity.account, &identity.issuer, now).await?;
            return Ok(CreatedUpload { id, upload_length: None });
        }

        let Some(rest) = upload_concat.strip_prefix("final;") else {
            return Err(AppError::BadRequest("malformed Upload-Concat header".into()));
        };
        let source_ids = parse_concat_urls(rest)?;
        if source_ids.is_empty() {
            return Err(AppError::BadRequest("final concatenation requires at least one partial upload".into()));
        }

        let mut total_size = 0u64;
        for src in &source_ids {
            let record = self.registry.lookup(src).await?;
            if record.deleted {
                return Err(AppError::BadRequest(format!("partial upload {src} no longer exists")));
            }
            let info = self.store.read_sidecar(src).await?;
            if !info.is_partial {
                return Err(AppError::BadRequest(format!("{src} is not a partial upload")));
            }
            if info.upload_length.map(|l| l != info.upload_offset).unwrap_or(true) {
                return Err(AppError::Conflict(format!("partial upload {src} is not complete")));
            }
            total_size += info.upload_offset;
        }

        let id = self
            .store
            .create_upload(Some(total_size), meta, false, &identity.remote_ip, &identity.account, &identity.issuer, now)
            .await?;
        self.store.concat_uploads(&id, &source_ids).await?;
        self.store
            .finish_upload(&id, self.settings.expiration.anonymous_ttl_seconds, self.settings.expiration.identified_ttl_seconds, now, &identity.account)
            .await?;

        Ok(CreatedUpload { id, upload_length: Some(total_size) })
    }

    /// HEAD /files/:id
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn head_upload(&self, id: &str) -> Result<UploadInfo, AppError> {
        let record = self.registry.lookup(id).await?;
        if record.deleted {
            return Err(AppError::NotFound);
        }
        self.store.read_sidecar(id).await
    }

    /// PATCH /files/:id
    #[tracing::instrument(level = "debug", skip(self, body))]
    pub async fn write_chunk(
        &self,
        id: &str,
        offset: u64,
        content_length: Option<u64>,
        body: &[u8],
        identity: &RequestIdentity,
        now: i64,
    ) -> Result<u64, AppError> {
        let record = self.registry.lookup(id).await?;
        if record.deleted {
            return Err(AppError::NotFound);
        }

        let info = self.store.read_sidecar(id).await?;
        if info.is_final {
            return Err(AppError::Conflict("upload is already finished".into()));
        }
        if info.is_partial && info.upload_length.is_some() && info.upload_offset >= info.upload_length.unwrap() {
            return Err(AppError::Conflict("upload is already complete".into()));
        }
        if offset != info.upload_offset {
            return Err(AppError::Conflict(format!("Upload-Offset {offset} does not match current offset {}", info.upload_offset)));
        }
        if let (Some(len), Some(content_len)) = (info.upload_length, content_length) {
            if info.upload_offset + content_len > len {
                return Err(AppError::BadRequest("chunk would exceed Upload-Length".into()));
            }
        }
        if info.upload_offset + body.len() as u64 > self.settings.storage.maximum_upload_size {
            return Err(AppError::TooLarge);
        }

        self.store.write_chunk(id, body).await?;

        let info = self.store.read_sidecar(id).await?;
        let is_complete = info.upload_length.map(|len| info.upload_offset >= len).unwrap_or(false);
        if is_complete && !info.is_partial {
            self.store
                .finish_upload(id, self.settings.expiration.anonymous_ttl_seconds, self.settings.expiration.identified_ttl_seconds, now, &identity.account)
                .await?;
        }

        Ok(info.upload_offset)
    }

    /// PATCH with `Upload-Defer-Length: 0` setting the length for the first time.
    pub async fn set_upload_length(&self, id: &str, length: u64) -> Result<(), AppError> {
        if length > self.settings.storage.maximum_upload_size {
            return Err(AppError::TooLarge);
        }
        self.store.set_upload_length(id, length).await
    }

    /// DELETE /files/:id — Termination, gated by ownership when the upload
    /// carries an identity.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_upload(&self, id: &str, identity: &RequestIdentity) -> Result<(), AppError> {
        let record = self.registry.lookup(id).await?;
        if record.deleted {
            return Err(AppError::NotFound);
        }
        self.authorize_owner(&record, identity)?;
        self.store.terminate(id).await
    }

    /// GET /files/:id — serves the finished blob directly; this extension
    /// is not part of core tus but is a convenience direct-download route.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_upload(&self, id: &str, identity: &RequestIdentity) -> Result<(UploadInfo, std::path::PathBuf), AppError> {
        let record = self.registry.lookup(id).await?;
        if record.deleted {
            return Err(AppError::NotFound);
        }
        let info = self.store.read_sidecar(id).await?;
        if !info.is_final {
            return Err(AppError::NotFound);
        }
        if self.settings.server.require_jwt_account {
            self.authorize_owner(&record, identity)?;
        }
        let path = self.store.resolve_path(id).await?;
        Ok((info, path))
    }

    fn authorize_owner(&self, record: &crate::registry::UploadRecord, identity: &RequestIdentity) -> Result<(), AppError> {
        if !record.jwt_account.is_empty() {
            if record.jwt_account != identity.account || record.jwt_issuer != identity.issuer {
                return Err(AppError::Unauthorized);
            }
            return Ok(());
        }
        if !record.uploader_ip.is_empty() && record.uploader_ip != identity.remote_ip {
            return Err(AppError::Unauthorized);
        }
        Ok(())
    }
}

/// Parses the `final;<url> <url> ...` tail of an `Upload-Concat` header,
/// extracting the trailing path segment of each URL as the upload id.
fn parse_concat_urls(rest: &str) -> Result<Vec<String>, AppError> {
    rest.split_whitespace()
        .map(|url| {
            url.rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| AppError::BadRequest(format!("malformed partial upload reference: {url}")))
        })
        .collect()
}

/// Single-range `Range: bytes=start-end` parsing for the convenience GET
/// route. Multi-range requests are rejected with a `416`, matching
/// `getFile`'s `mimeInlineBrowserWhitelist`-adjacent range handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: u64,
}

pub fn parse_range(header: &str, total_size: u64) -> Result<Option<ByteRange>, AppError> {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return Err(AppError::BadRequest("unsupported Range unit".into()));
    };
    if spec.contains(',') {
        return Err(AppError::Conflict("multi-range requests are not supported".into()));
    }
    let (start_s, end_s) = spec.split_once('-').ok_or_else(|| AppError::BadRequest("malformed Range header".into()))?;

    let (start, end_inclusive) = if start_s.is_empty() {
        let suffix_len: u64 = end_s.parse().map_err(|_| AppError::BadRequest("malformed Range header".into()))?;
        if suffix_len == 0 || total_size == 0 {
            return Ok(None);
        }
        let start = total_size.saturating_sub(suffix_len);
        (start, total_size - 1)
    } else {
        let start: u64 = start_s.parse().map_err(|_| AppError::BadRequest("malformed Range header".into()))?;
        let end = if end_s.is_empty() { total_size.saturating_sub(1) } else { end_s.parse().map_err(|_| AppError::BadRequest("malformed Range header".into()))? };
        (start, end)
    };

    if start > end_inclusive || start >= total_size {
        return Err(AppError::Conflict("range not satisfiable".into()));
    }
    Ok(Some(ByteRange { start, end_inclusive: end_inclusive.min(total_size.saturating_sub(1)) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_byte_range() {
        let r = parse_range("bytes=0-499", 1000).unwrap().unwrap();
        assert_eq!(r, ByteRange { start: 0, end_inclusive: 499 });
    }

    #[test]
    fn parses_suffix_range() {
        let r = parse_range("bytes=-500", 1000).unwrap().unwrap();
        assert_eq!(r, ByteRange { start: 500, end_inclusive: 999 });
    }

    #[test]
    fn parses_open_ended_range() {
        let r = parse_range("bytes=900-", 1000).unwrap().unwrap();
        assert_eq!(r, ByteRange { start: 900, end_inclusive: 999 });
    }

    #[test]
    fn rejects_multi_range() {
        let err = parse_range("bytes=0-1,2-3", 1000).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn rejects_range_past_end_of_file() {
        let err = parse_range("bytes=1000-1999", 1000).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn parses_concat_url_ids() {
        let ids = parse_concat_urls("/files/aaa /files/bbb").unwrap();
        assert_eq!(ids, vec!["aaa".to_string(), "bbb".to_string()]);
    }
}
