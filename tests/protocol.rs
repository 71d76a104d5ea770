//! End-to-end protocol scenarios driven directly against `Protocol`, through
//! direct calls rather than a spun-up listener.

use std::sync::Arc;

use tusistor::config::{DatabaseConfig, DatabaseKind, ExpirationConfig, ServerConfig, Settings, StorageConfig};
use tusistor::events::EventBus;
use tusistor::protocol::{Protocol, RequestIdentity};
use tusistor::registry::Registry;
use tusistor::store::BlobStore;

async fn harness() -> (Protocol, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let registry: Arc<dyn tusistor::registry::UploadRegistry> = Arc::new(Registry::connect_sqlite("sqlite::memory:").await.unwrap());
    let events = Arc::new(EventBus::new());
    let store = Arc::new(BlobStore::new(dir.path(), 3, registry.clone(), events.clone(), Vec::new()));

    let settings = Arc::new(Settings {
        server: ServerConfig {
            listen_address: "127.0.0.1:0".into(),
            base_path: "/files".into(),
            cors_origins: Vec::new(),
            trusted_reverse_proxy_ranges: Vec::new(),
            require_jwt_account: false,
        },
        storage: StorageConfig { path: dir.path().to_string_lossy().into_owned(), shard_layers: 3, maximum_upload_size: 1024 * 1024 },
        database: DatabaseConfig { kind: DatabaseKind::Sqlite, dsn: "sqlite::memory:".into() },
        expiration: ExpirationConfig { anonymous_ttl_seconds: 60, identified_ttl_seconds: 3600, check_interval_seconds: 1, grace_seconds: 1 },
        pre_finish_commands: Vec::new(),
        jwt_secrets_by_issuer: Default::default(),
        otlp_endpoint: None,
    });

    (Protocol { registry, store, events, settings }, dir)
}

fn identity(ip: &str) -> RequestIdentity {
    RequestIdentity { remote_ip: ip.to_string(), account: String::new(), issuer: String::new() }
}

/// S1: basic upload lifecycle, including the committed content hash.
#[tokio::test]
async fn basic_upload_lifecycle() {
    let (proto, _dir) = harness().await;

    let created = proto.create_upload(Some(5), false, None, None, &identity("203.0.113.5"), 1000).await.unwrap();
    assert_eq!(created.upload_length, Some(5));

    let offset = proto.write_chunk(&created.id, 0, Some(5), b"hello", &identity("203.0.113.5"), 1000).await.unwrap();
    assert_eq!(offset, 5);

    let info = proto.head_upload(&created.id).await.unwrap();
    assert_eq!(info.upload_offset, 5);
    assert_eq!(info.upload_length, Some(5));
    assert!(info.is_final);

    let (_, path) = proto.get_upload(&created.id, &identity("203.0.113.5")).await.unwrap();
    let body = tokio::fs::read(&path).await.unwrap();
    assert_eq!(body, b"hello");

    use sha2::Digest;
    let hash = hex_simd::encode_to_string(sha2::Sha256::digest(b"hello"), hex_simd::AsciiCase::Lower);
    assert!(path.to_string_lossy().contains(&hash));
}

/// S2: resuming from a partial offset after a simulated disconnect.
#[tokio::test]
async fn resume_after_partial_write() {
    let (proto, _dir) = harness().await;
    let created = proto.create_upload(Some(10), false, None, None, &identity(""), 1000).await.unwrap();

    proto.write_chunk(&created.id, 0, Some(4), b"1234", &identity(""), 1000).await.unwrap();
    let info = proto.head_upload(&created.id).await.unwrap();
    assert_eq!(info.upload_offset, 4);
    assert!(!info.is_final);

    let offset = proto.write_chunk(&created.id, 4, Some(6), b"567890", &identity(""), 1000).await.unwrap();
    assert_eq!(offset, 10);

    let info = proto.head_upload(&created.id).await.unwrap();
    assert!(info.is_final);
}

/// S3: writing at the wrong offset conflicts and leaves state untouched.
#[tokio::test]
async fn offset_mismatch_conflicts() {
    let (proto, _dir) = harness().await;
    let created = proto.create_upload(Some(10), false, None, None, &identity(""), 1000).await.unwrap();
    proto.write_chunk(&created.id, 0, Some(4), b"1234", &identity(""), 1000).await.unwrap();

    let err = proto.write_chunk(&created.id, 0, Some(4), b"????", &identity(""), 1000).await.unwrap_err();
    assert!(matches!(err, tusistor::error::AppError::Conflict(_)));

    let info = proto.head_upload(&created.id).await.unwrap();
    assert_eq!(info.upload_offset, 4);
}

/// S4: two identical uploads dedup to one blob; deleting the first keeps it
/// alive, deleting the second unlinks it.
#[tokio::test]
async fn duplicate_content_is_deduplicated_and_refcounted() {
    let (proto, _dir) = harness().await;

    let a = proto.create_upload(Some(5), false, None, None, &identity(""), 1000).await.unwrap();
    proto.write_chunk(&a.id, 0, Some(5), b"hello", &identity(""), 1000).await.unwrap();

    let b = proto.create_upload(Some(5), false, None, None, &identity(""), 1000).await.unwrap();
    proto.write_chunk(&b.id, 0, Some(5), b"hello", &identity(""), 1000).await.unwrap();

    let (_, path_a) = proto.get_upload(&a.id, &identity("")).await.unwrap();
    let (_, path_b) = proto.get_upload(&b.id, &identity("")).await.unwrap();
    assert_eq!(path_a, path_b);

    proto.delete_upload(&a.id, &identity("")).await.unwrap();
    assert!(path_a.exists(), "shared blob must survive while b still references it");

    proto.delete_upload(&b.id, &identity("")).await.unwrap();
    assert!(!path_a.exists(), "blob must be unlinked once both references are gone");
}

/// S5: DELETE is only permitted from the uploader's own IP when the upload
/// carries no JWT identity.
#[tokio::test]
async fn anonymous_ownership_gates_delete() {
    let (proto, _dir) = harness().await;
    let created = proto.create_upload(Some(5), false, None, None, &identity("203.0.113.5"), 1000).await.unwrap();

    let err = proto.delete_upload(&created.id, &identity("198.51.100.9")).await.unwrap_err();
    assert!(matches!(err, tusistor::error::AppError::Unauthorized));

    proto.delete_upload(&created.id, &identity("203.0.113.5")).await.unwrap();
    let err = proto.head_upload(&created.id).await.unwrap_err();
    assert!(matches!(err, tusistor::error::AppError::NotFound));
}

/// S6: the expirer sweep terminates an upload past its TTL and later purges
/// the tombstoned row once the grace period elapses.
#[tokio::test]
async fn expired_upload_is_swept_and_later_purged() {
    let (proto, _dir) = harness().await;
    let created = proto.create_upload(Some(5), false, None, None, &identity(""), 1_000).await.unwrap();
    proto.write_chunk(&created.id, 0, Some(5), b"hello", &identity(""), 1_000).await.unwrap();

    let expired = proto.registry.select_expired(1_000 + 61, 60, 3600).await.unwrap();
    assert!(expired.contains(&created.id));

    proto.store.terminate(&created.id).await.unwrap();
    let err = proto.head_upload(&created.id).await.unwrap_err();
    assert!(matches!(err, tusistor::error::AppError::NotFound));

    let purged = proto.registry.purge_tombstoned(1_000 + 61 + 1, 1, 60, 3600).await.unwrap();
    assert_eq!(purged, 1);
}

/// Creation-Defer-Length: the length can be supplied later, once, via a
/// follow-up PATCH.
#[tokio::test]
async fn deferred_length_is_set_exactly_once() {
    let (proto, _dir) = harness().await;
    let created = proto.create_upload(None, true, None, None, &identity(""), 1000).await.unwrap();
    assert!(created.upload_length.is_none());

    proto.set_upload_length(&created.id, 5).await.unwrap();
    let err = proto.set_upload_length(&created.id, 6).await.unwrap_err();
    assert!(matches!(err, tusistor::error::AppError::BadRequest(_)));

    let offset = proto.write_chunk(&created.id, 0, Some(5), b"hello", &identity(""), 1000).await.unwrap();
    assert_eq!(offset, 5);
}

/// Concatenation: a final upload assembles two completed partial uploads in
/// order.
#[tokio::test]
async fn final_concatenation_assembles_partials_in_order() {
    let (proto, _dir) = harness().await;

    let part_a = proto.create_upload(Some(3), false, None, Some("partial"), &identity(""), 1000).await.unwrap();
    proto.write_chunk(&part_a.id, 0, Some(3), b"foo", &identity(""), 1000).await.unwrap();

    let part_b = proto.create_upload(Some(3), false, None, Some("partial"), &identity(""), 1000).await.unwrap();
    proto.write_chunk(&part_b.id, 0, Some(3), b"bar", &identity(""), 1000).await.unwrap();

    let concat_header = format!("final;/files/{} /files/{}", part_a.id, part_b.id);
    let created = proto.create_upload(None, false, None, Some(&concat_header), &identity(""), 1000).await.unwrap();

    let (info, path) = proto.get_upload(&created.id, &identity("")).await.unwrap();
    assert_eq!(info.upload_offset, 6);
    let contents = tokio::fs::read(&path).await.unwrap();
    assert_eq!(contents, b"foobar");
}
