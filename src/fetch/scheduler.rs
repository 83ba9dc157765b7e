//! Periodic fetch scheduling and the worker pool.
//!
//! A single scheduler task ticks once a minute, selects the feeds that are
//! due and pushes them into a bounded work channel; a fixed set of worker
//! tasks pulls jobs and runs them behind a semaphore sized by the network
//! speed detector. The channel being bounded is the backpressure story:
//! a full queue blocks the producer rather than piling up work.
//!
//! Shutdown: cancel the token, drop the producer, let workers drain, join.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::feed::parser::{fetch_feed, FetchedFeed, ParseError};
use crate::rules;
use crate::state::AppState;
use crate::storage::{Feed, SettingKey};

pub const TICK_INTERVAL: Duration = Duration::from_secs(60);
pub const JOB_QUEUE_CAPACITY: usize = 32;
/// Fixed worker count at the fast tier's bound; the gate narrows actual
/// parallelism to the detected tier
pub const WORKER_COUNT: usize = 15;

/// Adaptive interval clamp
const ADAPTIVE_MIN_MINUTES: i64 = 5;
const ADAPTIVE_MAX_MINUTES: i64 = 24 * 60;
/// Below this many samples in the window the adaptive mode defers to the
/// global interval
const ADAPTIVE_MIN_SAMPLES: i64 = 5;
/// Posting-cadence window
const ADAPTIVE_WINDOW_SECS: i64 = 30 * 86_400;

/// One unit of fetch work.
#[derive(Debug)]
pub struct FetchJob {
    pub feed: Feed,
}

// ============================================================================
// Concurrency gate
// ============================================================================

/// Adjustable concurrency bound over a fixed worker pool.
///
/// Re-detection swaps in a fresh semaphore; in-flight permits on the old
/// one simply drain out.
pub struct ConcurrencyGate {
    inner: RwLock<Arc<Semaphore>>,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: RwLock::new(Arc::new(Semaphore::new(limit.max(1)))),
        }
    }

    pub fn set_limit(&self, limit: usize) {
        *self.inner.write() = Arc::new(Semaphore::new(limit.max(1)));
    }

    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        let semaphore = Arc::clone(&self.inner.read());
        semaphore.acquire_owned().await.expect("Semaphore closed")
    }
}

// ============================================================================
// Due-ness
// ============================================================================

/// Back-off multiplier after consecutive failures: ×2 per failure, capped
/// at ×8.
pub fn backoff_factor(consecutive_failures: i64) -> i64 {
    1 << consecutive_failures.clamp(0, 3)
}

/// Interval for adaptive feeds, derived from posting cadence.
///
/// `300 / articles_per_month` minutes, clamped to [5 min, 24 h]: a feed
/// posting about every hour pins the floor, a silent feed sits at the
/// ceiling. With fewer than five samples in the window the global interval
/// applies instead.
pub fn adaptive_interval_minutes(articles_per_month: i64, global_minutes: i64) -> i64 {
    if articles_per_month < ADAPTIVE_MIN_SAMPLES {
        if articles_per_month == 0 {
            return ADAPTIVE_MAX_MINUTES;
        }
        return global_minutes.clamp(ADAPTIVE_MIN_MINUTES, ADAPTIVE_MAX_MINUTES);
    }
    (300 / articles_per_month).clamp(ADAPTIVE_MIN_MINUTES, ADAPTIVE_MAX_MINUTES)
}

/// Resolve a feed's effective interval in minutes (before back-off).
pub async fn effective_interval_minutes(
    state: &AppState,
    feed: &Feed,
    global_minutes: i64,
    now: i64,
) -> i64 {
    match feed.refresh_interval {
        n if n > 0 => n,
        -1 => {
            let since = now - ADAPTIVE_WINDOW_SECS;
            let recent = state
                .db
                .recent_article_count(feed.id, since)
                .await
                .unwrap_or(0);
            adaptive_interval_minutes(recent, global_minutes)
        }
        _ => global_minutes,
    }
}

/// A feed is due when `now − last_updated ≥ interval × backoff`. Never
/// fetched means due now.
pub fn is_due(feed: &Feed, interval_minutes: i64, now: i64) -> bool {
    match feed.last_updated {
        None => true,
        Some(last_updated) => {
            let wait = interval_minutes * 60 * backoff_factor(feed.consecutive_failures);
            now - last_updated >= wait
        }
    }
}

// ============================================================================
// Spawning
// ============================================================================

pub struct SchedulerHandle {
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Wait for the scheduler and every worker to exit. Call after
    /// cancelling the shutdown token and dropping outstanding senders.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Spawn the scheduler task and the worker pool.
pub fn spawn(
    state: Arc<AppState>,
    job_rx: mpsc::Receiver<FetchJob>,
    shutdown: CancellationToken,
) -> SchedulerHandle {
    let job_rx = Arc::new(AsyncMutex::new(job_rx));

    let mut handles = Vec::with_capacity(WORKER_COUNT + 1);
    for worker_id in 0..WORKER_COUNT {
        handles.push(tokio::spawn(worker_loop(
            Arc::clone(&state),
            Arc::clone(&job_rx),
            shutdown.clone(),
            worker_id,
        )));
    }
    handles.push(tokio::spawn(scheduler_loop(state, shutdown)));

    SchedulerHandle { handles }
}

async fn scheduler_loop(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = scheduled_pass(&state, &shutdown).await {
                    tracing::warn!(error = %e, "scheduled pass failed");
                }
            }
        }
    }

    tracing::debug!("scheduler loop stopped");
}

/// One tick: enumerate feeds, enqueue the due ones.
async fn scheduled_pass(
    state: &Arc<AppState>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    // A batch in flight owns the progress counters; skip this tick
    if state.task_manager.is_running() {
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp();
    let global_minutes = state.db.setting_i64(SettingKey::UpdateInterval).await?.max(1);

    let feeds = state.db.get_feeds().await?;
    let mut due = Vec::new();
    for feed in feeds {
        let interval = effective_interval_minutes(state, &feed, global_minutes, now).await;
        if is_due(&feed, interval, now) {
            due.push(feed);
        }
    }

    if due.is_empty() {
        return Ok(());
    }

    tracing::info!(due = due.len(), "starting scheduled refresh");
    state.task_manager.start_batch(due.len());

    for feed in due {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = state.job_tx.send(FetchJob { feed }) => {
                if result.is_err() {
                    break; // channel closed, shutting down
                }
            }
        }
    }

    Ok(())
}

async fn worker_loop(
    state: Arc<AppState>,
    job_rx: Arc<AsyncMutex<mpsc::Receiver<FetchJob>>>,
    shutdown: CancellationToken,
    worker_id: usize,
) {
    loop {
        // Take the receiver lock only for the dequeue
        let job = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };

        let Some(job) = job else { break };

        // Cancellation aborts the in-flight fetch (dropping the future
        // tears down the HTTP request) but still accounts for the job
        tokio::select! {
            _ = shutdown.cancelled() => {
                state.task_manager.increment();
            }
            _ = process_job(&state, job) => {}
        }

        if state.task_manager.try_complete() {
            finish_batch(&state).await;
        }
    }

    tracing::debug!(worker_id = worker_id, "fetch worker stopped");
}

/// Fetch one feed, persist new articles, kick off enrichment.
async fn process_job(state: &Arc<AppState>, job: FetchJob) {
    let feed = job.feed;
    state.task_manager.set_current_feed(&feed.title);

    let _permit = state.gate.acquire().await;
    let now = chrono::Utc::now().timestamp();

    match fetch_through_cache(state, &feed).await {
        Ok(fetched) => match state.db.save_articles(feed.id, &fetched.articles).await {
            Ok(new_ids) => {
                if let Err(e) = state.db.record_fetch_success(feed.id, now).await {
                    tracing::warn!(feed_id = feed.id, error = %e, "failed to stamp fetch success");
                }
                let _ = state
                    .db
                    .update_feed_metadata(feed.id, fetched.title.as_deref(), fetched.image_url.as_deref())
                    .await;

                if !new_ids.is_empty() {
                    tracing::info!(feed_id = feed.id, new = new_ids.len(), "feed updated");
                    let state = Arc::clone(state);
                    tokio::spawn(async move {
                        state.orchestrator.translate_new_articles(&new_ids).await;
                        rules::apply_ingest_rules(&state.db, &new_ids).await;
                    });
                }
            }
            Err(e) => {
                let _ = state
                    .db
                    .record_fetch_failure(feed.id, &format!("database: {e}"), now)
                    .await;
            }
        },
        Err(e) => {
            let failures = state
                .db
                .record_fetch_failure(feed.id, &e.to_string(), now)
                .await
                .unwrap_or(0);
            tracing::warn!(
                feed_id = feed.id,
                title = %feed.title,
                failures = failures,
                error = %e,
                "feed fetch failed"
            );
        }
    }

    state.task_manager.increment();
}

/// Parser invocation goes through the parsed-feed cache: repeated refreshes
/// inside the TTL reuse the previous parse instead of refetching.
async fn fetch_through_cache(
    state: &Arc<AppState>,
    feed: &Feed,
) -> Result<FetchedFeed, ParseError> {
    if let Some(articles) = state.caches.parsed_feeds.get(&feed.id) {
        return Ok(FetchedFeed {
            title: None,
            image_url: None,
            articles,
        });
    }

    let fetched = fetch_feed(&state.client, feed, &state.config.scripts_dir()).await?;
    state
        .caches
        .parsed_feeds
        .put(feed.id, fetched.articles.clone());
    Ok(fetched)
}

/// Post-batch bookkeeping, run by whichever worker completes the batch.
async fn finish_batch(state: &Arc<AppState>) {
    let now = chrono::Utc::now().timestamp();
    if let Err(e) = state
        .db
        .set_setting(SettingKey::LastArticleUpdate, &now.to_string())
        .await
    {
        tracing::warn!(error = %e, "failed to stamp last_article_update");
    }

    let auto_cleanup = state
        .db
        .setting_bool(SettingKey::AutoCleanupEnabled)
        .await
        .unwrap_or(false);
    if auto_cleanup {
        match state.db.cleanup_old_articles().await {
            Ok(removed) if removed > 0 => {
                tracing::info!(removed = removed, "post-batch retention pass")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "retention pass failed"),
        }
    }

    tracing::info!("refresh batch complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use crate::storage::{FeedKind, NewFeed, UpdateStatus};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feed_row(id: i64, refresh_interval: i64, last_updated: Option<i64>, failures: i64) -> Feed {
        Feed {
            id,
            title: format!("Feed {id}"),
            url: format!("https://feed{id}.example.com/rss"),
            category: String::new(),
            image_url: None,
            kind: FeedKind::Rss,
            selectors: Default::default(),
            script_path: None,
            hidden: false,
            image_mode: false,
            proxy_url: None,
            refresh_interval,
            last_updated,
            last_error: None,
            last_status: UpdateStatus::Unknown,
            managed: false,
            consecutive_failures: failures,
        }
    }

    #[test]
    fn test_backoff_factor_caps_at_eight() {
        assert_eq!(backoff_factor(0), 1);
        assert_eq!(backoff_factor(1), 2);
        assert_eq!(backoff_factor(2), 4);
        assert_eq!(backoff_factor(3), 8);
        assert_eq!(backoff_factor(10), 8);
    }

    #[test]
    fn test_adaptive_interval_boundaries() {
        // No posting history at all: ceiling
        assert_eq!(adaptive_interval_minutes(0, 30), 24 * 60);
        // Very active feed: floor
        assert_eq!(adaptive_interval_minutes(60, 30), 5);
        // Sparse history falls back to the global interval
        assert_eq!(adaptive_interval_minutes(3, 45), 45);
        // Mid-range cadence
        assert_eq!(adaptive_interval_minutes(10, 30), 30);
        assert_eq!(adaptive_interval_minutes(20, 30), 15);
    }

    #[test]
    fn test_is_due_never_fetched() {
        let feed = feed_row(1, 0, None, 0);
        assert!(is_due(&feed, 30, 1_000_000));
    }

    #[test]
    fn test_is_due_respects_interval() {
        let now = 1_000_000;
        let feed = feed_row(1, 0, Some(now - 29 * 60), 0);
        assert!(!is_due(&feed, 30, now));

        let feed = feed_row(1, 0, Some(now - 30 * 60), 0);
        assert!(is_due(&feed, 30, now));
    }

    #[test]
    fn test_is_due_backoff_multiplies_interval() {
        let now = 1_000_000;
        // Two failures → ×4: a 30-minute feed waits two hours
        let feed = feed_row(1, 0, Some(now - 90 * 60), 2);
        assert!(!is_due(&feed, 30, now));

        let feed = feed_row(1, 0, Some(now - 120 * 60), 2);
        assert!(is_due(&feed, 30, now));
    }

    #[tokio::test]
    async fn test_effective_interval_explicit_override() {
        let (state, _rx) = test_state().await;
        let feed = feed_row(1, 90, None, 0);
        assert_eq!(effective_interval_minutes(&state, &feed, 30, 0).await, 90);

        let feed = feed_row(1, 0, None, 0);
        assert_eq!(effective_interval_minutes(&state, &feed, 30, 0).await, 30);
    }

    #[tokio::test]
    async fn test_effective_interval_adaptive_empty_history() {
        let (state, _rx) = test_state().await;
        let feed_id = state
            .db
            .add_feed(&NewFeed {
                title: "Adaptive".into(),
                url: "https://a.example.com/rss".into(),
                category: String::new(),
                image_url: None,
                kind: FeedKind::Rss,
                selectors: Default::default(),
                script_path: None,
                hidden: false,
                image_mode: false,
                proxy_url: None,
                refresh_interval: -1,
                managed: false,
            })
            .await
            .unwrap();

        let feed = state.db.get_feed_by_id(feed_id).await.unwrap().unwrap();
        let now = chrono::Utc::now().timestamp();
        assert_eq!(
            effective_interval_minutes(&state, &feed, 30, now).await,
            24 * 60,
            "zero articles per month clamps to 24h"
        );
    }

    #[tokio::test]
    async fn test_worker_pool_end_to_end() {
        const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title>
  <item><title>I1</title><link>https://example.com/1</link><pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>
  <item><title>I2</title><link>https://example.com/2</link><pubDate>Tue, 02 Jan 2024 00:00:00 GMT</pubDate></item>
</channel></rss>"#;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .mount(&server)
            .await;

        let (state, job_rx) = test_state().await;
        let feed_id = state
            .db
            .add_feed(&NewFeed {
                title: "Pool feed".into(),
                url: format!("{}/rss", server.uri()),
                category: String::new(),
                image_url: None,
                kind: FeedKind::Rss,
                selectors: Default::default(),
                script_path: None,
                hidden: false,
                image_mode: false,
                proxy_url: None,
                refresh_interval: 0,
                managed: false,
            })
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn(Arc::clone(&state), job_rx, shutdown.clone());

        // Enqueue a manual batch the way the refresh endpoint does
        let feed = state.db.get_feed_by_id(feed_id).await.unwrap().unwrap();
        state.task_manager.start_batch(1);
        state.job_tx.send(FetchJob { feed }).await.unwrap();

        // Wait for the batch to complete
        for _ in 0..100 {
            if !state.task_manager.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!state.task_manager.is_running(), "batch must complete");

        let articles = state
            .db
            .get_articles(Default::default(), None, None, false, 100, 0)
            .await
            .unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].title, "I2", "newest first");

        let feed = state.db.get_feed_by_id(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.last_status, UpdateStatus::Success);
        assert!(feed.last_updated.is_some());

        // Clean shutdown: cancel, close the channel, join
        shutdown.cancel();
        drop(state);
        handle.join().await;
    }

    #[tokio::test]
    async fn test_worker_records_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (state, job_rx) = test_state().await;
        let feed_id = state
            .db
            .add_feed(&NewFeed {
                title: "Broken".into(),
                url: format!("{}/rss", server.uri()),
                category: String::new(),
                image_url: None,
                kind: FeedKind::Rss,
                selectors: Default::default(),
                script_path: None,
                hidden: false,
                image_mode: false,
                proxy_url: None,
                refresh_interval: 0,
                managed: false,
            })
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn(Arc::clone(&state), job_rx, shutdown.clone());

        let feed = state.db.get_feed_by_id(feed_id).await.unwrap().unwrap();
        state.task_manager.start_batch(1);
        state.job_tx.send(FetchJob { feed }).await.unwrap();

        for _ in 0..100 {
            if !state.task_manager.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let feed = state.db.get_feed_by_id(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.last_status, UpdateStatus::Failed);
        assert_eq!(feed.consecutive_failures, 1);
        assert!(feed.last_error.as_deref().unwrap_or("").contains("500"));

        shutdown.cancel();
        drop(state);
        handle.join().await;
    }
}
