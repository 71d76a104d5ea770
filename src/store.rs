//! the sharded, content-addressed blob store. Scratch blobs live under
//! `incomplete/<id>.bin` during the active phase of an upload; on finalize
//! they are renamed to `complete/<shard>/<hash>.bin`, deduplicating against
//! any existing blob with the same SHA-256.
//!
//! Generalized from a one-blob-per-upload layout with content addressing
//! and reference counting against the upload registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::PreFinishCommand;
use crate::error::AppError;
use crate::events::{Event, EventBus};
use crate::metadata::Metadata;
use crate::registry::UploadRegistry;

const FILE_PERM: u32 = 0o664;
const DIR_PERM: u32 = 0o775;

/// The tus metadata sidecar, the source of truth for HEAD responses.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UploadInfo {
    pub id: String,
    pub upload_length: Option<u64>,
    pub upload_offset: u64,
    pub metadata: Metadata,
    pub is_partial: bool,
    pub is_final: bool,
    #[serde(default)]
    pub partial_uploads: Vec<String>,
    pub storage_path: PathBuf,
}

pub struct BlobStore {
    base_path: PathBuf,
    shard_layers: usize,
    registry: Arc<dyn UploadRegistry>,
    events: Arc<EventBus>,
    pre_finish_commands: Vec<PreFinishCommand>,
    /// Per-hash advisory locks guarding the rename tie-break at finalize
    /// time, scoped to this process only.
    hash_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").field("base_path", &self.base_path).finish()
    }
}

impl BlobStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        shard_layers: usize,
        registry: Arc<dyn UploadRegistry>,
        events: Arc<EventBus>,
        pre_finish_commands: Vec<PreFinishCommand>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            shard_layers,
            registry,
            events,
            pre_finish_commands,
            hash_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn hash_lock(&self, hash_hex: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.hash_locks.lock().await;
        table.entry(hash_hex.to_owned()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Computes `s[0]/s[1]/.../s[K-1]` relative to `root`. Panics if `s` is
    /// shorter than the configured shard layer count.
    fn shard_dir(&self, root: &Path, s: &str) -> PathBuf {
        assert!(s.len() >= self.shard_layers, "id/hash too short for the configured shard layer count");
        let mut path = root.to_path_buf();
        for ch in s[..self.shard_layers].chars() {
            path.push(ch.to_string());
        }
        path
    }

    fn incomplete_root(&self) -> PathBuf {
        self.base_path.join("incomplete")
    }

    fn complete_root(&self) -> PathBuf {
        self.base_path.join("complete")
    }

    fn meta_root(&self) -> PathBuf {
        self.base_path.join("meta")
    }

    pub fn scratch_path(&self, id: &str) -> PathBuf {
        self.incomplete_root().join(format!("{id}.bin"))
    }

    fn content_dir(&self, hash_hex: &str) -> PathBuf {
        self.shard_dir(&self.complete_root(), hash_hex)
    }

    pub fn content_path(&self, hash_hex: &str) -> PathBuf {
        self.content_dir(hash_hex).join(format!("{hash_hex}.bin"))
    }

    fn sidecar_dir(&self, id: &str) -> PathBuf {
        self.shard_dir(&self.meta_root(), id)
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.sidecar_dir(id).join(format!("{id}.info"))
    }

    async fn write_sidecar(&self, info: &UploadInfo) -> Result<(), AppError> {
        let dir = self.sidecar_dir(&info.id);
        create_dir_all_with_perm(&dir, DIR_PERM).await?;
        let data = serde_json::to_vec(info).map_err(|e| AppError::Corrupt(e.to_string()))?;
        let path = self.sidecar_path(&info.id);
        fs::write(&path, data).await?;
        set_perm(&path, FILE_PERM).await?;
        Ok(())
    }

    pub async fn read_sidecar(&self, id: &str) -> Result<UploadInfo, AppError> {
        let data = match fs::read(self.sidecar_path(id)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(AppError::NotFound),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| AppError::Corrupt(e.to_string()))
    }

    fn gen_id() -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex_simd::encode_to_string(bytes, hex_simd::AsciiCase::Lower)
    }

    /// CreateUpload: generates an id, creates the registry row and the
    /// empty scratch blob plus sidecar. Caller-supplied `RemoteIP` (and any
    /// other server-controlled key) must already have been stripped by the
    /// protocol layer before `metadata` reaches here.
    #[tracing::instrument(level = "debug", skip(self, metadata))]
    pub async fn create_upload(
        &self,
        upload_length: Option<u64>,
        metadata: Metadata,
        is_partial: bool,
        remote_ip: &str,
        account: &str,
        issuer: &str,
        created_at: i64,
    ) -> Result<String, AppError> {
        let id = Self::gen_id();

        create_dir_all_with_perm(&self.sidecar_dir(&id), DIR_PERM).await?;
        create_dir_all_with_perm(&self.incomplete_root(), DIR_PERM).await?;

        self.registry.insert(&id, created_at, remote_ip, account, issuer).await?;

        let scratch = self.scratch_path(&id);
        let file = tokio::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&scratch).await?;
        drop(file);
        set_perm(&scratch, FILE_PERM).await?;

        let info = UploadInfo {
            id: id.clone(),
            upload_length,
            upload_offset: 0,
            metadata,
            is_partial,
            is_final: false,
            partial_uploads: Vec::new(),
            storage_path: scratch,
        };
        self.write_sidecar(&info).await?;

        self.events
            .publish(Event::Created {
                id: id.clone(),
                size: upload_length,
                offset: 0,
                metadata: info.metadata.clone(),
            })
            .await;

        Ok(id)
    }

    /// WriteChunk: appends `data` to the scratch blob. The protocol layer
    /// already verified `offset == currentOffset`; the store does not seek.
    #[tracing::instrument(level = "debug", skip(self, data))]
    pub async fn write_chunk(&self, id: &str, data: &[u8]) -> Result<u64, AppError> {
        let path = self.scratch_path(id);
        let mut file = fs::OpenOptions::new().write(true).append(true).open(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let mut info = self.read_sidecar(id).await?;
        info.upload_offset += data.len() as u64;
        self.write_sidecar(&info).await?;

        self.events
            .publish(Event::Progress {
                id: id.to_owned(),
                size: info.upload_length,
                offset: info.upload_offset,
                metadata: info.metadata.clone(),
            })
            .await;

        Ok(data.len() as u64)
    }

    /// Sets (or updates, while unset) `Upload-Length` for a deferred-length
    /// upload, per the Creation-Defer-Length extension.
    pub async fn set_upload_length(&self, id: &str, length: u64) -> Result<(), AppError> {
        let mut info = self.read_sidecar(id).await?;
        if info.upload_length.is_some() {
            return Err(AppError::BadRequest("Upload-Length already set".into()));
        }
        info.upload_length = Some(length);
        self.write_sidecar(&info).await?;
        Ok(())
    }

    async fn sniff_mime(path: &Path) -> Result<String, AppError> {
        let mut file = fs::File::open(path).await?;
        let mut head = [0u8; 512];
        let n = file.read(&mut head).await?;
        Ok(sniff_mime_bytes(&head[..n]))
    }

    async fn run_prefinish_hooks(&self, path: &Path) -> Result<(), AppError> {
        if self.pre_finish_commands.is_empty() {
            return Ok(());
        }
        let mime = Self::sniff_mime(path).await?;
        for hook in &self.pre_finish_commands {
            let pattern = glob::Pattern::new(&hook.pattern).map_err(|e| AppError::Corrupt(e.to_string()))?;
            if !pattern.matches(&mime) {
                continue;
            }
            let status = tokio::process::Command::new(&hook.command)
                .args(&hook.args)
                .arg(path)
                .status()
                .await?;
            if !status.success() && hook.reject_on_nonzero_exit {
                return Err(AppError::Rejected(format!("pre-finish hook {} rejected the upload", hook.command)));
            }
        }
        Ok(())
    }

    async fn sha256_file(path: &Path) -> Result<[u8; 32], AppError> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }

    /// FinishUpload: hashes the scratch file, commits the hash to the
    /// registry, then renames (or dedups against) the content blob.
    /// The hash commit precedes the rename so a crash in between leaves a
    /// reconcilable state: the scratch still exists and matches the
    /// committed hash, and `resolve_path` repairs it lazily on next access.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn finish_upload(&self, id: &str, anonymous_ttl: i64, identified_ttl: i64, now: i64, account: &str) -> Result<(), AppError> {
        let scratch = self.scratch_path(id);

        if let Err(e) = self.run_prefinish_hooks(&scratch).await {
            if matches!(e, AppError::Rejected(_)) {
                self.terminate(id).await?;
            }
            return Err(e);
        }

        let hash = Self::sha256_file(&scratch).await?;
        let hash_hex = hex_simd::encode_to_string(hash, hex_simd::AsciiCase::Lower);

        let expires_at = now + if account.is_empty() { anonymous_ttl } else { identified_ttl };
        self.registry.set_finalized(id, &hash, expires_at).await?;

        self.materialize_content_blob(&scratch, &hash_hex).await?;

        let mut info = self.read_sidecar(id).await?;
        info.storage_path = self.content_path(&hash_hex);
        info.is_final = true;
        self.write_sidecar(&info).await?;

        self.events
            .publish(Event::Finished {
                id: id.to_owned(),
                size: info.upload_length,
                offset: info.upload_offset,
                metadata: info.metadata.clone(),
            })
            .await;

        Ok(())
    }

    /// Renames `scratch` into the content-addressed path for `hash_hex`,
    /// or unlinks it if a blob with that hash already exists. Tolerates a
    /// concurrent finalize racing on the same hash via the per-hash lock
    /// and `ENOENT`/`EEXIST` tolerance on the filesystem calls.
    async fn materialize_content_blob(&self, scratch: &Path, hash_hex: &str) -> Result<(), AppError> {
        let lock = self.hash_lock(hash_hex).await;
        let _guard = lock.lock().await;

        let content_dir = self.content_dir(hash_hex);
        create_dir_all_with_perm(&content_dir, DIR_PERM).await?;
        let content_path = self.content_path(hash_hex);

        if fs::metadata(&content_path).await.is_ok() {
            // a blob with this hash already exists: this scratch is a
            // duplicate, drop it. Tolerate ENOENT from a concurrent finalize
            // on the same hash having already removed it.
            match fs::remove_file(scratch).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            match fs::rename(scratch, &content_path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // lost the race: someone else's rename landed first and
                    // removed our parent assumption; retry once.
                    create_dir_all_with_perm(&content_dir, DIR_PERM).await?;
                    match fs::rename(scratch, &content_path).await {
                        Ok(()) => Ok(()),
                        Err(_) => {
                            // the other writer's content blob exists now; our
                            // scratch is a duplicate, drop it.
                            let _ = fs::remove_file(scratch).await;
                            Ok(())
                        }
                    }
                }
                Err(e) if is_cross_device(&e) => copy_then_unlink(scratch, &content_path).await,
                Err(e) => Err(e.into()),
            }
        }
    }

    /// ResolvePath: looks up `sha256sum`; NULL returns the scratch path,
    /// else the content path. Performs a lazy repair: if the content blob
    /// is missing but the scratch still exists and hashes to the committed
    /// value, it completes the deferred rename before returning.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve_path(&self, id: &str) -> Result<PathBuf, AppError> {
        let record = self.registry.lookup(id).await?;
        let Some(hash) = record.sha256sum else {
            return Ok(self.scratch_path(id));
        };
        let hash_hex = hex_simd::encode_to_string(&hash, hex_simd::AsciiCase::Lower);
        let content_path = self.content_path(&hash_hex);

        if fs::metadata(&content_path).await.is_ok() {
            return Ok(content_path);
        }

        let scratch = self.scratch_path(id);
        if fs::metadata(&scratch).await.is_ok() {
            let actual = Self::sha256_file(&scratch).await?;
            if actual.as_slice() == hash.as_slice() {
                self.materialize_content_blob(&scratch, &hash_hex).await?;
                return Ok(content_path);
            }
        }

        Err(AppError::Corrupt(format!("upload {id} has a committed hash with no reachable blob")))
    }

    /// Terminate: removes the blob (if no other record still references its
    /// hash), removes the sidecar, and tombstones the registry row. The
    /// blob-before-record ordering means a crash leaves at most a dangling
    /// row, which the expirer re-processes; the inverse would leak storage.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn terminate(&self, id: &str) -> Result<(), AppError> {
        let record = match self.registry.lookup(id).await {
            Ok(r) => r,
            Err(AppError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };

        if record.deleted {
            // idempotent: blob/sidecar already removed by a prior call.
            self.registry.mark_deleted(id).await?;
            return Ok(());
        }

        let mut size = 0u64;
        let mut meta = Metadata::new();
        if let Ok(info) = self.read_sidecar(id).await {
            size = info.upload_offset;
            meta = info.metadata;
        }

        match &record.sha256sum {
            None => {
                remove_file_and_empty_ancestors(&self.scratch_path(id), &self.incomplete_root()).await?;
            }
            Some(hash) => {
                let hash_hex = hex_simd::encode_to_string(hash, hex_simd::AsciiCase::Lower);
                let lock = self.hash_lock(&hash_hex).await;
                let _guard = lock.lock().await;

                let duplicates = self.registry.duplicate_count(hash, id).await?;
                if duplicates == 0 {
                    remove_file_and_empty_ancestors(&self.content_path(&hash_hex), &self.complete_root()).await?;
                }
            }
        }

        remove_file_and_empty_ancestors(&self.sidecar_path(id), &self.meta_root()).await?;
        self.registry.mark_deleted(id).await?;

        self.events
            .publish(Event::Terminated { id: id.to_owned(), size: Some(size), offset: size, metadata: meta })
            .await;

        Ok(())
    }

    /// Concatenation: appends each source blob, in order, into the
    /// destination's scratch file. Source blobs are left untouched and
    /// remain independently addressable until their own terminate.
    #[tracing::instrument(level = "debug", skip(self, source_ids))]
    pub async fn concat_uploads(&self, dest_id: &str, source_ids: &[String]) -> Result<u64, AppError> {
        let dest_path = self.scratch_path(dest_id);
        let mut dest = fs::OpenOptions::new().write(true).append(true).open(&dest_path).await?;

        let mut total = 0u64;
        for src_id in source_ids {
            let src_path = self.resolve_path(src_id).await?;
            let mut src = fs::File::open(&src_path).await?;
            total += tokio::io::copy(&mut src, &mut dest).await?;
        }

        let mut info = self.read_sidecar(dest_id).await?;
        info.upload_offset += total;
        info.partial_uploads = source_ids.to_vec();
        self.write_sidecar(&info).await?;

        Ok(total)
    }
}

fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc_exdev())
}

/// `EXDEV`, hardcoded rather than depending on the `libc` crate for a single
/// constant (its value is stable across the Linux/BSD targets this service
/// runs on).
fn libc_exdev() -> i32 {
    18
}

async fn copy_then_unlink(src: &Path, dst: &Path) -> Result<(), AppError> {
    fs::copy(src, dst).await?;
    fs::remove_file(src).await?;
    Ok(())
}

async fn set_perm(path: &Path, mode: u32) -> Result<(), AppError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

async fn create_dir_all_with_perm(path: &Path, mode: u32) -> Result<(), AppError> {
    fs::create_dir_all(path).await?;
    set_perm(path, mode).await
}

/// Removes `path`, then walks upward removing empty directories up to (but
/// not including) `stop_at`. Tolerates `ENOENT` throughout, so a repeated
/// terminate on the same id is a no-op rather than an error.
async fn remove_file_and_empty_ancestors(path: &Path, stop_at: &Path) -> Result<(), AppError> {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == stop_at || !d.starts_with(stop_at) {
            break;
        }
        match fs::remove_dir(d).await {
            Ok(()) => dir = d.parent(),
            Err(_) => break, // not empty, or already gone; stop climbing
        }
    }
    Ok(())
}

fn sniff_mime_bytes(head: &[u8]) -> String {
    if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png".to_owned()
    } else if head.starts_with(b"\xff\xd8\xff") {
        "image/jpeg".to_owned()
    } else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        "image/gif".to_owned()
    } else if head.starts_with(b"%PDF-") {
        "application/pdf".to_owned()
    } else if head.len() >= 4 && &head[0..4] == b"RIFF" {
        "audio/wave".to_owned()
    } else if std::str::from_utf8(head).is_ok() {
        "text/plain".to_owned()
    } else {
        "application/octet-stream".to_owned()
    }
}
