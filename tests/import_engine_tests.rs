use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{http::header, routing::get, Router};
use chrono::FixedOffset;
use mongodb::bson::DateTime as BsonDateTime;
use serde_json::json;
use tempfile::TempDir;

use post_import_service::config::Config;
use post_import_service::mapping::FieldMapper;
use post_import_service::models::*;
use post_import_service::processing::{HttpImageFetcher, ImageSideloader};
use post_import_service::storage::{
    ContentStore, MemoryAttachmentStore, MemoryContentStore, MemorySessionStore, SessionStore,
};
use post_import_service::sync::{EngineSettings, ImportEngine, RowImporter};

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";

struct Harness {
    engine: ImportEngine,
    sessions: Arc<MemorySessionStore>,
    content: Arc<MemoryContentStore>,
    attachments: Arc<MemoryAttachmentStore>,
    dir: TempDir,
}

impl Harness {
    fn new(batch_size: usize) -> Self {
        Self::with_lease(batch_size, Duration::from_secs(300))
    }

    fn with_lease(batch_size: usize, lease_ttl: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(MemorySessionStore::new());
        let content = Arc::new(MemoryContentStore::new());
        let attachments = Arc::new(MemoryAttachmentStore::new());

        let fetcher = Arc::new(HttpImageFetcher::new(&Config::from_env()).unwrap());
        let sideloader = ImageSideloader::new(fetcher, attachments.clone());
        let mapper = FieldMapper::new(FixedOffset::east_opt(0).unwrap(), "post", "publish");
        let importer = RowImporter::new(mapper, content.clone(), sideloader);
        let settings = EngineSettings {
            batch_size,
            lease_ttl,
            upload_dir: dir.path().join("uploads"),
        };
        let engine = ImportEngine::new(sessions.clone(), importer, settings);

        Self { engine, sessions, content, attachments, dir }
    }

    fn write_csv(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn prepare(&self, path: &Path) -> String {
        self.engine.prepare(path, None).await.unwrap().token
    }
}

fn mapping(columns: &[(&str, &str)], skip_duplicates: bool) -> BatchRequest {
    BatchRequest {
        columns: columns
            .iter()
            .map(|(header, target)| {
                let (field_type, meta_key) = match target.split_once(':') {
                    Some((t, k)) => (t.to_string(), Some(k.to_string())),
                    None => (target.to_string(), None),
                };
                ColumnMappingInput { header: header.to_string(), field_type, meta_key }
            })
            .collect(),
        skip_duplicates,
    }
}

async fn image_server() -> String {
    let app = Router::new()
        .route("/{name}", get(|| async { ([(header::CONTENT_TYPE, "image/png")], PNG_BYTES) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_prepare_returns_headers_and_field_types() {
    let h = Harness::new(10);
    let path = h.write_csv("posts.csv", "\u{feff}Title,Body,Price\nA,a,1\n");

    let prepared = h.engine.prepare(&path, Some("posts.csv")).await.unwrap();
    assert_eq!(prepared.headers, vec!["Title", "Body", "Price"]);
    assert_eq!(prepared.allowed_field_types.len(), 9);

    let session = h.sessions.load(&prepared.token).await.unwrap();
    assert_eq!(session.state(), SessionState::Created);
    assert_eq!(session.original_filename.as_deref(), Some("posts.csv"));
}

#[tokio::test]
async fn test_prepare_rejects_empty_file() {
    let h = Harness::new(10);
    let path = h.write_csv("empty.csv", "");
    let err = h.engine.prepare(&path, None).await.unwrap_err();
    assert!(matches!(err, ImportError::EmptyOrUnreadableFile(_)));
    assert!(h.sessions.is_empty().await);
}

#[tokio::test]
async fn test_batches_advance_until_done() {
    let h = Harness::new(2);
    let path = h.write_csv("posts.csv", "Title\nFirst\nSecond\nThird\n");
    let token = h.prepare(&path).await;

    let first = h
        .engine
        .process_batch(&token, Some(&mapping(&[("Title", "title")], false)))
        .await
        .unwrap();
    assert_eq!((first.imported, first.skipped, first.failed, first.total), (2, 0, 0, 3));
    assert!(!first.done);
    assert_eq!(first.state, SessionState::Running);

    let second = h.engine.process_batch(&token, None).await.unwrap();
    assert_eq!((second.imported, second.failed), (3, 0));
    assert!(second.done);
    assert!(!second.retryable);
    assert_eq!(second.state, SessionState::Complete);

    // Further calls change nothing
    let third = h.engine.process_batch(&token, None).await.unwrap();
    assert!(third.done);
    assert_eq!(third.imported, 3);
    assert_eq!(h.content.posts().await.len(), 3);

    let titles: Vec<String> = h.content.posts().await.into_iter().map(|p| p.post.title).collect();
    assert_eq!(titles, vec!["First", "Second", "Third"]);
}

#[tokio::test]
async fn test_invalid_image_url_can_be_fixed_and_retried() {
    let base = image_server().await;
    let h = Harness::new(10);
    let path = h.write_csv(
        "posts.csv",
        &format!("Title,Image,Alt\nAlpha,not a url,\nBeta,{}/beta.png,Beta cover\n", base),
    );
    let token = h.prepare(&path).await;

    let request = mapping(&[("Title", "title"), ("Image", "image-url"), ("Alt", "image-alt")], false);
    let progress = h.engine.process_batch(&token, Some(&request)).await.unwrap();
    assert_eq!((progress.imported, progress.failed), (1, 1));
    assert!(!progress.done);
    assert!(progress.retryable);

    // The failed row's post was still inserted, without an image
    let posts = h.content.posts().await;
    assert_eq!(posts.len(), 2);
    assert!(posts[0].featured_image.is_none());
    assert!(posts[1].featured_image.is_some());

    std::fs::write(
        &path,
        format!("Title,Image,Alt\nAlpha,{}/alpha.png,\nBeta,{}/beta.png,Beta cover\n", base, base),
    )
    .unwrap();

    let retried = h.engine.retry_failed(&token).await.unwrap();
    assert_eq!((retried.imported, retried.skipped, retried.failed), (2, 0, 1));
    assert!(retried.done);
    assert!(!retried.retryable);

    let posts = h.content.posts().await;
    assert_eq!(posts.len(), 3);
    assert_eq!(posts[2].slug, "alpha-2");
    assert!(posts[2].featured_image.is_some());

    let attachments = h.attachments.attachments().await;
    assert_eq!(attachments.len(), 2);
    assert_eq!(attachments[0].alt_text.as_deref(), Some("Beta cover"));
}

#[tokio::test]
async fn test_duplicates_are_skipped_by_slug() {
    let h = Harness::new(10);
    let mut existing = NewPost::new("post", "publish");
    existing.title = "Existing Post".to_string();
    let existing_id = h.content.insert(&existing).await.unwrap();

    let path = h.write_csv("posts.csv", "Title,Slug\nExisting Post,\nFresh,existing-post\nBrand New,\n");
    let token = h.prepare(&path).await;

    let progress = h
        .engine
        .process_batch(&token, Some(&mapping(&[("Title", "title"), ("Slug", "slug")], true)))
        .await
        .unwrap();
    assert_eq!((progress.imported, progress.skipped, progress.failed), (1, 2, 0));
    assert!(progress.done);

    let posts = h.content.posts().await;
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].id, existing_id);
    assert_eq!(posts[1].post.title, "Brand New");
}

#[tokio::test]
async fn test_custom_fields_and_additional_images_are_stored() {
    let h = Harness::new(10);
    let path = h.write_csv(
        "posts.csv",
        "Title,Price,Specs,Gallery,Ignored\nWidget,9.99,\"{\"\"color\"\":\"\"red\"\"}\",\"https://a/1.jpg, https://a/2.jpg\",x\n",
    );
    let token = h.prepare(&path).await;

    let request = mapping(
        &[
            ("Title", "post_title"),
            ("Price", "custom-field:Price"),
            ("Specs", "custom_field:specs"),
            ("Gallery", "additional-images"),
        ],
        false,
    );
    let progress = h.engine.process_batch(&token, Some(&request)).await.unwrap();
    assert_eq!(progress.imported, 1);

    let post = &h.content.posts().await[0];
    assert_eq!(post.meta_value("price"), Some(&json!("9.99")));
    assert_eq!(post.meta_value("specs"), Some(&json!({"color": "red"})));
    assert_eq!(post.meta_value("additional_images"), Some(&json!("https://a/1.jpg, https://a/2.jpg")));
    assert_eq!(post.meta.len(), 3);
}

#[tokio::test]
async fn test_row_errors_do_not_abort_the_batch() {
    let h = Harness::new(10);
    let path = h.write_csv("posts.csv", "Title,Date\nGood,2024-01-02\nBad date,someday\n,\nLast,\n");
    let token = h.prepare(&path).await;

    let progress = h
        .engine
        .process_batch(&token, Some(&mapping(&[("Title", "title"), ("Date", "date")], false)))
        .await
        .unwrap();
    // "Bad date" fails to parse, the blank row has nothing to insert
    assert_eq!((progress.imported, progress.failed, progress.total), (2, 2, 4));
    assert!(progress.retryable);

    let session = h.sessions.load(&token).await.unwrap();
    assert_eq!(session.failed_rows.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn test_mapping_is_frozen_after_first_call() {
    let h = Harness::new(1);
    let path = h.write_csv("posts.csv", "Title\nOne\nTwo\n");
    let token = h.prepare(&path).await;

    h.engine
        .process_batch(&token, Some(&mapping(&[("Title", "title")], false)))
        .await
        .unwrap();
    h.engine
        .process_batch(&token, Some(&mapping(&[("Title", "slug")], true)))
        .await
        .unwrap();

    let session = h.sessions.load(&token).await.unwrap();
    let frozen = session.mapping.unwrap();
    assert_eq!(frozen.columns.len(), 1);
    assert_eq!(frozen.columns[0].field_type, FieldType::Title);
    assert!(!frozen.skip_duplicates);
    assert_eq!(h.content.posts().await[1].post.title, "Two");
}

#[tokio::test]
async fn test_mapping_required_leaves_session_untouched() {
    let h = Harness::new(10);
    let path = h.write_csv("posts.csv", "Title\nOne\n");
    let token = h.prepare(&path).await;
    let before = h.sessions.load(&token).await.unwrap();

    let err = h
        .engine
        .process_batch(&token, Some(&mapping(&[("Nope", "title"), ("Title", "thumbnail")], false)))
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::MappingRequired));

    let err = h.engine.process_batch(&token, None).await.unwrap_err();
    assert!(matches!(err, ImportError::MappingRequired));

    assert_eq!(h.sessions.load(&token).await.unwrap(), before);
}

#[tokio::test]
async fn test_unknown_token() {
    let h = Harness::new(10);
    let err = h.engine.process_batch("missing", None).await.unwrap_err();
    assert!(matches!(err, ImportError::SessionNotFound(_)));
    let err = h.engine.retry_failed("missing").await.unwrap_err();
    assert!(matches!(err, ImportError::SessionNotFound(_)));
    assert!(matches!(h.engine.progress("missing").await, Err(ImportError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_header_only_file_completes_immediately() {
    let h = Harness::new(10);
    let path = h.write_csv("posts.csv", "Title,Body\n");
    let token = h.prepare(&path).await;

    let progress = h
        .engine
        .process_batch(&token, Some(&mapping(&[("Title", "title")], false)))
        .await
        .unwrap();
    assert_eq!((progress.total, progress.imported), (0, 0));
    assert!(progress.done);
    assert!(h.sessions.load(&token).await.unwrap().mapping.is_some());
}

#[tokio::test]
async fn test_unreadable_source_leaves_session_unchanged() {
    let h = Harness::new(1);
    let path = h.write_csv("posts.csv", "Title\nOne\nTwo\n");
    let token = h.prepare(&path).await;
    h.engine
        .process_batch(&token, Some(&mapping(&[("Title", "title")], false)))
        .await
        .unwrap();
    let before = h.sessions.load(&token).await.unwrap();

    std::fs::remove_file(&path).unwrap();
    let err = h.engine.process_batch(&token, None).await.unwrap_err();
    assert!(matches!(err, ImportError::Transport(_)), "{}", err);
    assert_eq!(err.class(), ErrorClass::Transport);

    assert_eq!(h.sessions.load(&token).await.unwrap(), before);
}

#[tokio::test]
async fn test_live_claim_rejects_concurrent_batch() {
    let h = Harness::new(10);
    let path = h.write_csv("posts.csv", "Title\nOne\nTwo\n");
    let token = h.prepare(&path).await;

    let mut session = h.sessions.load(&token).await.unwrap();
    let columns = vec![ColumnMapping { header: "Title".into(), field_type: FieldType::Title, meta_key: None }];
    session.freeze_mapping(columns, false, 2);
    session.claim(vec![0, 1], false, "other-worker".into(), BsonDateTime::now());
    h.sessions.overwrite(session.clone()).await;

    let err = h.engine.process_batch(&token, None).await.unwrap_err();
    assert!(matches!(err, ImportError::BatchInProgress(_)));
    assert_eq!(h.sessions.load(&token).await.unwrap(), session);
    assert!(h.content.posts().await.is_empty());
}

#[tokio::test]
async fn test_expired_claim_is_recovered_and_retryable() {
    let h = Harness::with_lease(10, Duration::from_secs(60));
    let path = h.write_csv("posts.csv", "Title\nOne\nTwo\nThree\n");
    let token = h.prepare(&path).await;

    let mut session = h.sessions.load(&token).await.unwrap();
    let columns = vec![ColumnMapping { header: "Title".into(), field_type: FieldType::Title, meta_key: None }];
    session.freeze_mapping(columns, false, 3);
    let crashed_at = BsonDateTime::from_millis(BsonDateTime::now().timestamp_millis() - 10 * 60 * 1000);
    session.claim(vec![0, 1], false, "crashed-worker".into(), crashed_at);
    h.sessions.overwrite(session).await;

    let progress = h.engine.process_batch(&token, None).await.unwrap();
    assert_eq!((progress.imported, progress.failed), (1, 2));
    assert!(progress.retryable);
    assert!(!progress.done);

    let retried = h.engine.retry_failed(&token).await.unwrap();
    assert_eq!((retried.imported, retried.failed), (3, 2));
    assert!(retried.done);

    let titles: Vec<String> = h.content.posts().await.into_iter().map(|p| p.post.title).collect();
    assert_eq!(titles, vec!["Three", "One", "Two"]);
}

#[tokio::test]
async fn test_retry_with_nothing_failed_is_a_noop() {
    let h = Harness::new(10);
    let path = h.write_csv("posts.csv", "Title\nOne\n");
    let token = h.prepare(&path).await;
    h.engine
        .process_batch(&token, Some(&mapping(&[("Title", "title")], false)))
        .await
        .unwrap();
    let before = h.sessions.load(&token).await.unwrap();

    let progress = h.engine.retry_failed(&token).await.unwrap();
    assert!(progress.done);
    assert_eq!(progress.imported, 1);
    assert_eq!(h.sessions.load(&token).await.unwrap(), before);
}

#[tokio::test]
async fn test_uploads_are_stored_and_evicted() {
    let h = Harness::new(10);

    let err = h.engine.prepare_upload("posts.txt", b"Title\nA\n").await.unwrap_err();
    assert!(matches!(err, ImportError::InvalidUpload(_)));

    let stale = h.engine.prepare_upload("old posts.csv", b"Title\nA\n").await.unwrap();
    let fresh = h.engine.prepare_upload("new.csv", b"Title\nB\n").await.unwrap();

    let mut old_session = h.sessions.load(&stale.token).await.unwrap();
    let upload_path = PathBuf::from(&old_session.source_path);
    assert!(upload_path.starts_with(h.dir.path().join("uploads")));
    assert!(upload_path.exists());
    old_session.updated_at = BsonDateTime::from_millis(BsonDateTime::now().timestamp_millis() - 3 * 3600 * 1000);
    h.sessions.overwrite(old_session).await;

    let evicted = h.engine.evict_stale_sessions(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(evicted, 1);
    assert!(!upload_path.exists());
    assert!(matches!(h.sessions.load(&stale.token).await, Err(ImportError::SessionNotFound(_))));
    assert!(h.sessions.load(&fresh.token).await.is_ok());
}

#[tokio::test]
async fn test_eviction_keeps_files_outside_upload_dir() {
    let h = Harness::new(10);
    let path = h.write_csv("local.csv", "Title\nA\n");
    let token = h.prepare(&path).await;

    let mut session = h.sessions.load(&token).await.unwrap();
    session.updated_at = BsonDateTime::from_millis(0);
    h.sessions.overwrite(session).await;

    assert_eq!(h.engine.evict_stale_sessions(Duration::from_secs(60)).await.unwrap(), 1);
    assert!(path.exists());
}

#[tokio::test]
async fn test_recovered_lease_drops_late_outcomes() {
    let app = Router::new().route(
        "/{name}",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(2000)).await;
            ([(header::CONTENT_TYPE, "image/png")], PNG_BYTES)
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let h = Harness::with_lease(10, Duration::from_millis(500));
    let path = h.write_csv("posts.csv", &format!("Title,Image\nSlow,{}/slow.png\n", base));
    let token = h.prepare(&path).await;

    // First call claims the row and then outlives its lease on the image download
    let engine = h.engine.clone();
    let first_token = token.clone();
    let first = tokio::spawn(async move {
        let request = mapping(&[("Title", "title"), ("Image", "image-url")], false);
        engine.process_batch(&first_token, Some(&request)).await
    });

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let second = h.engine.retry_failed(&token).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!((first.imported, first.failed), (0, 1));
    assert_eq!((second.imported, second.skipped, second.failed, second.total), (1, 0, 1, 1));
    assert!(second.done);
    assert!(!second.retryable);

    let session = h.sessions.load(&token).await.unwrap();
    assert!(session.counters.imported + session.counters.skipped <= session.total_rows());
    assert!(session.failed_rows.is_empty());
    assert!(session.in_flight.is_none());
    assert_eq!(session.state(), SessionState::Complete);

    // Both attempts inserted a post; only the recovered one is counted
    assert_eq!(h.content.posts().await.len(), 2);
}
