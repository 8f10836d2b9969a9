//! Integration tests for the fetch/apply updaters against a mock backend.

mod support;

use flagsync_api::{ApiConfig, FlagsApiClient};
use flagsync_storage::{
    InMemoryMembershipsCache, InMemorySegmentsCache, InMemorySplitsCache, MembershipsCache,
    SegmentsCache, SplitsCache,
};
use flagsync_sync::task::{SyncJob, SyncTask, TaskContext};
use flagsync_sync::updaters::{MembershipsUpdater, SegmentsUpdater, SplitsUpdater};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api(server: &MockServer) -> FlagsApiClient {
    FlagsApiClient::new(ApiConfig::for_base_url("sdk-test", server.uri()))
}

fn splits_updater(
    server: &MockServer,
) -> (
    SplitsUpdater,
    Arc<InMemorySplitsCache>,
    Arc<InMemorySegmentsCache>,
) {
    let splits = Arc::new(InMemorySplitsCache::new());
    let segments = Arc::new(InMemorySegmentsCache::new());
    let updater = SplitsUpdater::new(api(server), splits.clone(), segments.clone());
    (updater, splits, segments)
}

async fn requests_to(server: &MockServer, path_prefix: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().starts_with(path_prefix))
        .count()
}

// --- Splits ---

#[tokio::test]
async fn splits_sync_applies_changes_and_registers_referenced_segments() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/splitChanges"))
        .and(query_param("since", "-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::split_changes_body(
            -1,
            100,
            &[
                support::split("checkout_v2", 100),
                support::split_with_segment("beta_gate", "beta_users", 100),
            ],
        )))
        .mount(&server)
        .await;

    let (updater, splits, segments) = splits_updater(&server);
    let pass = updater.sync(&TaskContext::detached()).await.unwrap();

    assert!(pass.applied);
    assert!(pass.new_segments);
    assert_eq!(splits.change_number(), 100);
    assert!(splits.get("checkout_v2").unwrap().is_some());
    assert!(splits.uses_segments());
    assert_eq!(
        segments.registered_segments().unwrap(),
        vec!["beta_users".to_string()]
    );
}

#[tokio::test]
async fn splits_sync_skips_snapshot_not_newer_than_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/splitChanges"))
        .and(query_param("since", "-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::split_changes_body(
            -1,
            100,
            &[support::split("checkout_v2", 100)],
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/splitChanges"))
        .and(query_param("since", "100"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(support::split_changes_body(100, 100, &[])),
        )
        .mount(&server)
        .await;

    let (updater, splits, _) = splits_updater(&server);
    assert!(updater.sync(&TaskContext::detached()).await.unwrap().applied);
    assert!(!updater.sync(&TaskContext::detached()).await.unwrap().applied);
    assert_eq!(splits.change_number(), 100);
}

#[tokio::test]
async fn archived_splits_are_removed_from_the_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/splitChanges"))
        .and(query_param("since", "-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::split_changes_body(
            -1,
            100,
            &[support::split("old_feature", 100)],
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/splitChanges"))
        .and(query_param("since", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::split_changes_body(
            100,
            200,
            &[support::archived_split("old_feature", 200)],
        )))
        .mount(&server)
        .await;

    let (updater, splits, _) = splits_updater(&server);
    updater.sync(&TaskContext::detached()).await.unwrap();
    assert!(splits.get("old_feature").unwrap().is_some());

    updater.sync(&TaskContext::detached()).await.unwrap();
    assert!(splits.get("old_feature").unwrap().is_none());
    assert_eq!(splits.change_number(), 200);
}

#[tokio::test]
async fn kill_marks_the_split_and_fetches_the_newer_definition() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/splitChanges"))
        .and(query_param("since", "-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::split_changes_body(
            -1,
            100,
            &[support::split("checkout_v2", 100)],
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/splitChanges"))
        .and(query_param("since", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::split_changes_body(
            100,
            150,
            &[support::split("checkout_v2", 150)],
        )))
        .mount(&server)
        .await;

    let (updater, splits, _) = splits_updater(&server);
    updater.sync(&TaskContext::detached()).await.unwrap();

    updater.kill("checkout_v2", "off", 150).await.unwrap();

    // The follow-up fetch replaced the locally killed definition with
    // server truth.
    assert_eq!(splits.change_number(), 150);
    let split = splits.get("checkout_v2").unwrap().unwrap();
    assert!(!split.killed);
    assert_eq!(requests_to(&server, "/splitChanges").await, 2);
}

#[tokio::test]
async fn stale_kill_is_dropped_without_a_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/splitChanges"))
        .and(query_param("since", "-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::split_changes_body(
            -1,
            100,
            &[support::split("checkout_v2", 100)],
        )))
        .mount(&server)
        .await;

    let (updater, splits, _) = splits_updater(&server);
    updater.sync(&TaskContext::detached()).await.unwrap();

    updater.kill("checkout_v2", "off", 50).await.unwrap();

    let split = splits.get("checkout_v2").unwrap().unwrap();
    assert!(!split.killed);
    assert_eq!(splits.change_number(), 100);
    assert_eq!(requests_to(&server, "/splitChanges").await, 1);
}

#[tokio::test]
async fn splits_task_stopped_mid_fetch_discards_the_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/splitChanges"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(support::split_changes_body(
                    -1,
                    100,
                    &[support::split("checkout_v2", 100)],
                ))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    struct SplitsJob(SplitsUpdater);

    #[async_trait::async_trait]
    impl SyncJob for SplitsJob {
        async fn run(&self, ctx: &TaskContext) -> flagsync_sync::error::SyncResult<()> {
            self.0.sync(ctx).await.map(|_| ())
        }
    }

    let (updater, splits, _) = splits_updater(&server);
    let task = SyncTask::new(
        "splits",
        Duration::from_secs(3600),
        Arc::new(SplitsJob(updater)) as Arc<dyn SyncJob>,
    );

    task.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.stop();

    // Let the delayed response arrive after the stop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(splits.change_number(), -1);
    assert!(splits.get("checkout_v2").unwrap().is_none());
}

// --- Segments ---

#[tokio::test]
async fn segment_sync_applies_the_diff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/segmentChanges/beta_users"))
        .and(query_param("since", "-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::segment_changes_body(
            "beta_users",
            &["user-1", "user-2"],
            &[],
            -1,
            50,
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/segmentChanges/beta_users"))
        .and(query_param("since", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::segment_changes_body(
            "beta_users",
            &["user-3"],
            &["user-1"],
            50,
            60,
        )))
        .mount(&server)
        .await;

    let segments = Arc::new(InMemorySegmentsCache::new());
    segments.register_segments(&["beta_users".to_string()]).unwrap();
    let updater = SegmentsUpdater::new(api(&server), segments.clone());

    assert!(updater
        .sync_segment("beta_users", None, &TaskContext::detached())
        .await
        .unwrap());
    assert!(segments.is_in_segment("beta_users", "user-1").unwrap());
    assert!(segments.is_in_segment("beta_users", "user-2").unwrap());

    assert!(updater
        .sync_segment("beta_users", Some(60), &TaskContext::detached())
        .await
        .unwrap());
    assert!(!segments.is_in_segment("beta_users", "user-1").unwrap());
    assert!(segments.is_in_segment("beta_users", "user-3").unwrap());
    assert_eq!(segments.change_number("beta_users"), 60);
}

#[tokio::test]
async fn segment_sync_skips_targets_the_cache_already_covers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/segmentChanges/beta_users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::segment_changes_body(
            "beta_users",
            &["user-1"],
            &[],
            -1,
            50,
        )))
        .mount(&server)
        .await;

    let segments = Arc::new(InMemorySegmentsCache::new());
    segments.register_segments(&["beta_users".to_string()]).unwrap();
    let updater = SegmentsUpdater::new(api(&server), segments.clone());

    updater
        .sync_segment("beta_users", None, &TaskContext::detached())
        .await
        .unwrap();
    assert!(!updater
        .sync_segment("beta_users", Some(50), &TaskContext::detached())
        .await
        .unwrap());
    assert!(!updater
        .sync_segment("beta_users", Some(30), &TaskContext::detached())
        .await
        .unwrap());
    assert_eq!(requests_to(&server, "/segmentChanges").await, 1);
}

#[tokio::test]
async fn segment_sync_all_continues_past_a_failing_segment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/segmentChanges/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/segmentChanges/healthy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::segment_changes_body(
            "healthy",
            &["user-1"],
            &[],
            -1,
            10,
        )))
        .mount(&server)
        .await;

    let segments = Arc::new(InMemorySegmentsCache::new());
    segments
        .register_segments(&["broken".to_string(), "healthy".to_string()])
        .unwrap();
    let updater = SegmentsUpdater::new(api(&server), segments.clone());

    updater.sync_all(&TaskContext::detached(), false).await.unwrap();
    assert!(segments.is_in_segment("healthy", "user-1").unwrap());
    assert_eq!(segments.change_number("broken"), -1);
}

#[tokio::test]
async fn segment_sync_all_only_new_skips_segments_already_fetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/segmentChanges/seen"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::segment_changes_body(
            "seen",
            &["user-1"],
            &[],
            -1,
            10,
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/segmentChanges/fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::segment_changes_body(
            "fresh",
            &["user-2"],
            &[],
            -1,
            20,
        )))
        .mount(&server)
        .await;

    let segments = Arc::new(InMemorySegmentsCache::new());
    segments
        .register_segments(&["seen".to_string(), "fresh".to_string()])
        .unwrap();
    let updater = SegmentsUpdater::new(api(&server), segments.clone());

    updater
        .sync_segment("seen", None, &TaskContext::detached())
        .await
        .unwrap();
    updater.sync_all(&TaskContext::detached(), true).await.unwrap();

    assert!(segments.is_in_segment("fresh", "user-2").unwrap());
    assert_eq!(requests_to(&server, "/segmentChanges/seen").await, 1);
    assert_eq!(requests_to(&server, "/segmentChanges/fresh").await, 1);
}

// --- Memberships ---

#[tokio::test]
async fn memberships_sync_resets_the_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/memberships/user-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(support::memberships_body(&["beta", "vip"])),
        )
        .mount(&server)
        .await;

    let memberships = Arc::new(InMemoryMembershipsCache::new());
    let updater = MembershipsUpdater::new(api(&server), memberships.clone());

    let changed = updater
        .sync_key("user-1", -1, &TaskContext::detached())
        .await
        .unwrap();
    assert!(changed);
    assert!(memberships.is_in_segment("user-1", "beta").unwrap());
    assert!(memberships.is_in_segment("user-1", "vip").unwrap());
}

#[tokio::test]
async fn memberships_sync_skips_targets_the_key_already_covers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/memberships/user-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(support::memberships_body(&["beta"])))
        .mount(&server)
        .await;

    let memberships = Arc::new(InMemoryMembershipsCache::new());
    let updater = MembershipsUpdater::new(api(&server), memberships.clone());

    // Target change number advances the key.
    updater
        .sync_key("user-1", 5, &TaskContext::detached())
        .await
        .unwrap();
    assert_eq!(memberships.change_number("user-1"), 5);

    // Older or equal targets are already covered.
    assert!(!updater
        .sync_key("user-1", 5, &TaskContext::detached())
        .await
        .unwrap());
    assert!(!updater
        .sync_key("user-1", 3, &TaskContext::detached())
        .await
        .unwrap());
    assert_eq!(requests_to(&server, "/memberships").await, 1);

    // -1 always fetches.
    updater
        .sync_key("user-1", -1, &TaskContext::detached())
        .await
        .unwrap();
    assert_eq!(requests_to(&server, "/memberships").await, 2);
}
