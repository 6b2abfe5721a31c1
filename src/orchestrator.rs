//! Sync run orchestration
//!
//! Drives one supplier end to end: stream records from the feed, map them,
//! classify against the snapshot, and fan the changed products out to a
//! bounded pool of workers that reconcile categories, deliver images and
//! upsert remotely. Unchanged products are filtered before any worker or
//! rate token is spent on them, so a rerun over an unchanged feed performs
//! zero remote calls.

use crate::category::CategoryTree;
use crate::config::{RunOptions, SupplierProfile};
use crate::delta::{classify, DeltaAction};
use crate::error::{Result, SyncError};
use crate::images::host::ImageHost;
use crate::images::ImagePipeline;
use crate::mapper;
use crate::models::{
    ItemError, RunState, SnapshotEntry, StagedImage, SyncRun, UnifiedProduct,
};
use crate::rate_limit::RateLimiter;
use crate::remote::{with_backoff, RemoteCatalog};
use crate::source;
use crate::store;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// How long the end of a run waits for the remote to pull published images
const IMAGE_PULL_WAIT: Duration = Duration::from_secs(30);

/// What a worker has to do for one product.
enum Job {
    Create,
    Update(i64),
    /// Re-deliver images for an already synced product (--images-only)
    Refresh(i64),
}

enum ItemOutcome {
    Created,
    Updated,
    Skipped,
    Failed { message: String },
}

struct WorkerResult {
    sku: String,
    outcome: ItemOutcome,
    /// Per-image failures; the product still synced with the rest
    image_errors: Vec<ItemError>,
}

/// Everything a worker needs, shared across the run.
struct RunContext {
    profile: SupplierProfile,
    options: RunOptions,
    conn: Arc<Mutex<Connection>>,
    remote: Arc<dyn RemoteCatalog>,
    pipeline: ImagePipeline,
    limiter: RateLimiter,
    host: Option<ImageHost>,
    categories: tokio::sync::Mutex<CategoryTree>,
    cancel: watch::Receiver<bool>,
}

/// Orchestrates sync runs over a shared store and remote client.
pub struct SyncEngine {
    conn: Arc<Mutex<Connection>>,
    remote: Arc<dyn RemoteCatalog>,
    /// Host address the remote uses to pull images from this machine
    advertise_host: Option<String>,
}

impl SyncEngine {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        remote: Arc<dyn RemoteCatalog>,
        advertise_host: Option<String>,
    ) -> Self {
        Self {
            conn,
            remote,
            advertise_host,
        }
    }

    /// Run one supplier sync to completion, abort, or external shutdown.
    pub async fn run(
        &self,
        profile: &SupplierProfile,
        options: &RunOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SyncRun> {
        let mut run = SyncRun::start(&profile.code);
        log::info!(
            "Starting run {} (dry_run={}, images_only={})",
            run.id,
            options.dry_run,
            options.images_only
        );

        let (snapshot, tree) = {
            let conn = self.conn.lock().unwrap();
            store::record_run(&conn, &run)?;
            let snapshot = store::load_snapshot(&conn, &profile.code)?;
            let tree = CategoryTree::from_nodes(store::load_category_tree(&conn)?);
            (snapshot, tree)
        };
        log::info!(
            "Loaded snapshot with {} products and {} known categories",
            snapshot.len(),
            tree.len()
        );

        let mut adapter = source::open_adapter(profile)?;

        let host = if options.dry_run {
            None
        } else {
            let host = ImageHost::start(self.advertise_host.as_deref())
                .await
                .map_err(|e| SyncError::Config(format!("image host: {}", e)))?;
            Some(host)
        };

        let pipeline = ImagePipeline::new(Duration::from_secs(30))
            .map_err(|e| SyncError::Config(format!("image pipeline: {}", e)))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        if *shutdown.borrow() {
            let _ = cancel_tx.send(true);
        }
        {
            // Forward external shutdown (Ctrl-C) into the run's cancel signal
            let cancel_tx = cancel_tx.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                if shutdown.wait_for(|stop| *stop).await.is_ok() {
                    log::warn!("Shutdown requested, cancelling run");
                    let _ = cancel_tx.send(true);
                }
            });
        }

        let ctx = Arc::new(RunContext {
            profile: profile.clone(),
            options: options.clone(),
            conn: self.conn.clone(),
            remote: self.remote.clone(),
            pipeline,
            limiter: RateLimiter::new(profile.concurrency, profile.requests_per_second),
            host,
            categories: tokio::sync::Mutex::new(tree),
            cancel: cancel_rx.clone(),
        });

        let threshold = profile.abort_after_consecutive_failures.max(1);
        // Worker pool never smaller than one, matching the limiter's clamp
        let worker_cap = profile.concurrency.max(1);
        let mut join_set: JoinSet<WorkerResult> = JoinSet::new();
        let mut consecutive: u32 = 0;
        let mut pulled: usize = 0;
        let mut aborted = false;

        'feed: while let Some(next) = adapter.next_record() {
            if *cancel_rx.borrow() {
                aborted = true;
                break;
            }
            if let Some(limit) = options.limit {
                if pulled >= limit {
                    log::info!("Record limit of {} reached", limit);
                    break;
                }
            }

            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    // Feed-level failure; nothing sensible can follow it
                    log::error!("Feed error, aborting run: {}", e);
                    self.finalize(&mut run, RunState::Aborted)?;
                    return Err(e.into());
                }
            };
            pulled += 1;
            run.counters.processed += 1;

            let product = match mapper::map_record(&record, profile) {
                Ok(product) => product,
                Err(e) => {
                    log::warn!("Record {} failed mapping: {}", record.supplier_ref, e);
                    run.counters.failed += 1;
                    run.errors.push(ItemError {
                        sku: record.supplier_ref.clone(),
                        message: e.to_string(),
                    });
                    consecutive += 1;
                    if consecutive >= threshold {
                        aborted = true;
                        break;
                    }
                    continue;
                }
            };

            let job = match classify(&product, &snapshot) {
                DeltaAction::Unchanged { remote_id } => {
                    if options.images_only {
                        Job::Refresh(remote_id)
                    } else {
                        run.counters.unchanged += 1;
                        consecutive = 0;
                        continue;
                    }
                }
                DeltaAction::Create if options.images_only => {
                    // Never synced, so there is nothing to refresh
                    continue;
                }
                DeltaAction::Create => Job::Create,
                DeltaAction::Update { remote_id } => Job::Update(remote_id),
            };

            if options.dry_run {
                match job {
                    Job::Create => run.counters.created += 1,
                    Job::Update(_) | Job::Refresh(_) => run.counters.updated += 1,
                }
                consecutive = 0;
                continue;
            }

            // Backpressure: never queue more than one extra batch of work
            while join_set.len() >= worker_cap * 2 {
                if let Some(joined) = join_set.join_next().await {
                    record_outcome(joined, &mut run, &mut consecutive);
                    if consecutive >= threshold {
                        aborted = true;
                        break 'feed;
                    }
                }
            }

            let ctx = ctx.clone();
            join_set.spawn(async move { sync_one(ctx, product, job).await });
        }

        if adapter.skipped() > 0 {
            log::warn!("{} malformed feed records were skipped", adapter.skipped());
        }
        if aborted {
            let _ = cancel_tx.send(true);
        }

        while let Some(joined) = join_set.join_next().await {
            record_outcome(joined, &mut run, &mut consecutive);
            if !aborted && consecutive >= threshold {
                aborted = true;
                let _ = cancel_tx.send(true);
            }
        }

        if let Some(host) = &ctx.host {
            if !aborted {
                host.wait_until_fetched(IMAGE_PULL_WAIT).await;
            }
            host.shutdown().await;
        }

        let externally_cancelled = *cancel_rx.borrow() && !aborted;
        let state = if aborted || externally_cancelled {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        self.finalize(&mut run, state)?;

        log::info!(
            "Run {} {:?}: {} processed, {} created, {} updated, {} unchanged, {} failed",
            run.id,
            run.state,
            run.counters.processed,
            run.counters.created,
            run.counters.updated,
            run.counters.unchanged,
            run.counters.failed
        );
        // A sample of failures for the console; the full list is in the store
        for error in run.errors.iter().take(5) {
            log::info!("  failed {}: {}", error.sku, error.message);
        }
        if run.errors.len() > 5 {
            log::info!("  ... and {} more in the run log", run.errors.len() - 5);
        }
        Ok(run)
    }

    fn finalize(&self, run: &mut SyncRun, state: RunState) -> Result<()> {
        run.finish(state);
        let conn = self.conn.lock().unwrap();
        store::record_run(&conn, run)?;
        Ok(())
    }
}

fn record_outcome(
    joined: std::result::Result<WorkerResult, tokio::task::JoinError>,
    run: &mut SyncRun,
    consecutive: &mut u32,
) {
    let result = match joined {
        Ok(result) => result,
        Err(e) => {
            log::error!("Worker task failed: {}", e);
            run.counters.failed += 1;
            *consecutive += 1;
            return;
        }
    };
    run.errors.extend(result.image_errors);
    match result.outcome {
        ItemOutcome::Created => {
            run.counters.created += 1;
            *consecutive = 0;
        }
        ItemOutcome::Updated => {
            run.counters.updated += 1;
            *consecutive = 0;
        }
        ItemOutcome::Skipped => {}
        ItemOutcome::Failed { message } => {
            log::warn!("Product {} failed: {}", result.sku, message);
            run.counters.failed += 1;
            run.errors.push(ItemError {
                sku: result.sku,
                message,
            });
            *consecutive += 1;
        }
    }
}

/// One product, end to end, inside a worker.
async fn sync_one(ctx: Arc<RunContext>, product: UnifiedProduct, job: Job) -> WorkerResult {
    let sku = product.sku.clone();
    let mut image_errors = Vec::new();
    match sync_one_inner(&ctx, &product, &job, &mut image_errors).await {
        Ok(outcome) => WorkerResult {
            sku,
            outcome,
            image_errors,
        },
        Err(e) => WorkerResult {
            sku,
            outcome: ItemOutcome::Failed {
                message: e.to_string(),
            },
            image_errors,
        },
    }
}

async fn sync_one_inner(
    ctx: &RunContext,
    product: &UnifiedProduct,
    job: &Job,
    image_errors: &mut Vec<ItemError>,
) -> Result<ItemOutcome> {
    let _guard = ctx.limiter.acquire().await;
    if *ctx.cancel.borrow() {
        return Ok(ItemOutcome::Skipped);
    }

    let category_id = match job {
        Job::Refresh(_) => None,
        _ => ensure_categories(ctx, product).await,
    };

    let (image_urls, staged) = stage_and_publish(ctx, product, image_errors).await;

    let remote_id = match *job {
        Job::Create => {
            let id = with_backoff(&ctx.profile.retry, || {
                ctx.remote.create_product(product, category_id, &image_urls)
            })
            .await?;
            id
        }
        Job::Update(remote_id) => {
            with_backoff(&ctx.profile.retry, || {
                ctx.remote
                    .update_product(remote_id, product, category_id, &image_urls)
            })
            .await?;
            remote_id
        }
        Job::Refresh(remote_id) => {
            if image_urls.is_empty() {
                // Everything already delivered, nothing to push
                return Ok(ItemOutcome::Skipped);
            }
            with_backoff(&ctx.profile.retry, || {
                ctx.remote
                    .update_product(remote_id, product, category_id, &image_urls)
            })
            .await?;
            remote_id
        }
    };

    {
        let conn = ctx.conn.lock().unwrap();
        for image in &staged {
            if let Err(e) =
                store::mark_image_delivered(&conn, &product.sku, &image.source_url, &image.checksum)
            {
                log::warn!("Could not record delivered image: {}", e);
            }
        }
        store::save_snapshot_entry(
            &conn,
            &SnapshotEntry {
                supplier: product.supplier.clone(),
                sku: product.sku.clone(),
                checksum: product.checksum(),
                remote_id,
            },
        )?;
    }

    Ok(match job {
        Job::Create => ItemOutcome::Created,
        Job::Update(_) | Job::Refresh(_) => ItemOutcome::Updated,
    })
}

/// Make sure the product's category path exists remotely, parent before
/// child. Serialized across workers; the tree lock is held over the creates
/// so two workers can never race on the same node.
async fn ensure_categories(ctx: &RunContext, product: &UnifiedProduct) -> Option<i64> {
    let root = ctx.profile.category_root.as_deref();
    if product.category_path.is_empty() && root.is_none() {
        return None;
    }

    let mut tree = ctx.categories.lock().await;
    let keys = tree.ensure_path(root, &product.category_path);
    for key in tree.pending_along(&keys) {
        let (name, parent_id) = {
            let node = tree.node(&key)?;
            (node.name.clone(), tree.parent_remote_id(&key))
        };
        match with_backoff(&ctx.profile.retry, || {
            ctx.remote.create_category(&name, parent_id)
        })
        .await
        {
            Ok(remote_id) => {
                tree.set_remote_id(&key, remote_id);
                if let Some(node) = tree.node(&key) {
                    let conn = ctx.conn.lock().unwrap();
                    if let Err(e) = store::persist_category_node(&conn, node) {
                        log::warn!("Could not persist category {}: {}", key, e);
                    }
                }
            }
            Err(e) => {
                // The product syncs uncategorized rather than failing
                log::warn!("Could not create category '{}': {}", name, e);
                return tree.leaf_remote_id(&keys);
            }
        }
    }
    tree.leaf_remote_id(&keys)
}

/// Fetch, transform and publish a product's images. Images that the remote
/// already pulled in a previous run (same source, same transformed bytes)
/// are skipped; broken images are recorded individually and dropped.
async fn stage_and_publish(
    ctx: &RunContext,
    product: &UnifiedProduct,
    image_errors: &mut Vec<ItemError>,
) -> (Vec<String>, Vec<StagedImage>) {
    let Some(host) = &ctx.host else {
        return (Vec::new(), Vec::new());
    };

    let mut urls = Vec::new();
    let mut published = Vec::new();
    for source_url in &product.image_urls {
        let staged = match ctx.pipeline.stage(&product.sku, source_url).await {
            Ok(staged) => staged,
            Err(e) => {
                log::warn!("Skipping image {} for {}: {}", source_url, product.sku, e);
                image_errors.push(ItemError {
                    sku: product.sku.clone(),
                    message: e.to_string(),
                });
                continue;
            }
        };

        let already_delivered = {
            let conn = ctx.conn.lock().unwrap();
            match store::image_delivered(&conn, &product.sku, source_url, &staged.checksum) {
                Ok(delivered) => delivered,
                Err(e) => {
                    log::warn!("Delivered-image lookup failed: {}", e);
                    false
                }
            }
        };
        if already_delivered {
            log::debug!("Image {} for {} already delivered", source_url, product.sku);
            continue;
        }

        urls.push(host.publish(&staged));
        published.push(staged);
    }
    (urls, published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedFormat, RetrySettings};
    use crate::error::RemoteError;
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// In-memory remote that records every call.
    struct FakeRemote {
        calls: Mutex<Vec<String>>,
        next_id: AtomicI64,
        fail_products: bool,
    }

    impl FakeRemote {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                next_id: AtomicI64::new(100),
                fail_products: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail_products: true,
                ..Self::new()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteCatalog for FakeRemote {
        async fn create_product(
            &self,
            product: &UnifiedProduct,
            _category_id: Option<i64>,
            image_urls: &[String],
        ) -> std::result::Result<i64, RemoteError> {
            if self.fail_products {
                return Err(RemoteError::ValidationFailure("nope".into()));
            }
            // The real remote pulls media while handling the upsert
            for url in image_urls {
                let _ = reqwest::get(url).await;
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!(
                    "create_product {} images={}",
                    product.sku,
                    image_urls.len()
                ));
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn update_product(
            &self,
            remote_id: i64,
            product: &UnifiedProduct,
            _category_id: Option<i64>,
            _image_urls: &[String],
        ) -> std::result::Result<(), RemoteError> {
            if self.fail_products {
                return Err(RemoteError::ValidationFailure("nope".into()));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("update_product {} {}", product.sku, remote_id));
            Ok(())
        }

        async fn create_category(
            &self,
            name: &str,
            parent_id: Option<i64>,
        ) -> std::result::Result<i64, RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create_category {} parent={:?}", name, parent_id));
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn test_conn() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        store::init_schema(&conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn write_feed(rows: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "productCode,language,active,name,description,brand,price.currency,minQty.1,price.1\n{}",
            rows
        )
        .unwrap();
        file
    }

    fn csv_profile(path: PathBuf) -> SupplierProfile {
        SupplierProfile {
            code: "BIC".into(),
            name: "BIC".into(),
            format: FeedFormat::CsvMasterfile { path },
            preferred_language: Some("en".into()),
            language_fallbacks: vec![],
            category_root: None,
            concurrency: 2,
            requests_per_second: 1000,
            retry: RetrySettings {
                max_retries: 0,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
            },
            abort_after_consecutive_failures: 25,
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test process
        std::mem::forget(tx);
        rx
    }

    async fn run_once(
        conn: &Arc<Mutex<Connection>>,
        remote: &Arc<FakeRemote>,
        profile: &SupplierProfile,
        options: &RunOptions,
    ) -> SyncRun {
        let engine = SyncEngine::new(
            conn.clone(),
            remote.clone() as Arc<dyn RemoteCatalog>,
            None,
        );
        engine.run(profile, options, no_shutdown()).await.unwrap()
    }

    #[tokio::test]
    async fn second_run_over_unchanged_feed_is_all_unchanged() {
        let feed = write_feed(
            "P1,en,1,Pen,Blue pen,Writers,EUR,1,0.45\n\
             P2,en,1,Notebook,A5,Paper,EUR,1,1.20\n",
        );
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::new());
        let profile = csv_profile(feed.path().to_path_buf());

        let first = run_once(&conn, &remote, &profile, &RunOptions::default()).await;
        assert_eq!(first.state, RunState::Completed);
        assert_eq!(first.counters.created, 2);
        let calls_after_first = remote.calls().len();

        let second = run_once(&conn, &remote, &profile, &RunOptions::default()).await;
        assert_eq!(second.counters.unchanged, 2);
        assert_eq!(second.counters.created, 0);
        assert_eq!(second.counters.updated, 0);
        // No product or category calls at all on the second pass
        assert_eq!(remote.calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn changed_product_is_updated_in_place() {
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::new());

        let feed = write_feed("P1,en,1,Pen,Blue pen,Writers,EUR,1,0.45\n");
        let profile = csv_profile(feed.path().to_path_buf());
        run_once(&conn, &remote, &profile, &RunOptions::default()).await;

        // Same product, new price
        let feed = write_feed("P1,en,1,Pen,Blue pen,Writers,EUR,1,0.55\n");
        let profile = csv_profile(feed.path().to_path_buf());
        let run = run_once(&conn, &remote, &profile, &RunOptions::default()).await;

        assert_eq!(run.counters.updated, 1);
        assert_eq!(run.counters.created, 0);
        assert!(remote
            .calls()
            .iter()
            .any(|c| c.starts_with("update_product BIC_P1")));
    }

    #[tokio::test]
    async fn categories_are_created_parent_first_and_once() {
        // Both products share the "Writers" brand category
        let feed = write_feed(
            "P1,en,1,Pen,Blue pen,Writers,EUR,1,0.45\n\
             P2,en,1,Pencil,HB pencil,Writers,EUR,1,0.30\n",
        );
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::new());
        let mut profile = csv_profile(feed.path().to_path_buf());
        profile.category_root = Some("Office".into());

        run_once(&conn, &remote, &profile, &RunOptions::default()).await;

        let category_calls: Vec<String> = remote
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create_category"))
            .collect();
        // Two-level path, created exactly once, parent before child
        assert_eq!(category_calls.len(), 2);
        assert!(category_calls[0].starts_with("create_category Office parent=None"));
        assert!(category_calls[1].starts_with("create_category Writers parent=Some"));
    }

    #[tokio::test]
    async fn consecutive_failures_abort_the_run() {
        let rows: String = (0..20)
            .map(|i| format!("P{},en,1,Item {},desc,Brand,EUR,1,1.00\n", i, i))
            .collect();
        let feed = write_feed(&rows);
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::failing());
        let mut profile = csv_profile(feed.path().to_path_buf());
        profile.abort_after_consecutive_failures = 3;
        profile.concurrency = 1;

        let run = run_once(&conn, &remote, &profile, &RunOptions::default()).await;
        assert_eq!(run.state, RunState::Aborted);
        assert!(run.counters.failed >= 3);
        // The run stopped well before the end of the feed
        assert!(run.counters.processed < 20);
        assert!(!run.errors.is_empty());
    }

    #[tokio::test]
    async fn dry_run_makes_no_remote_calls() {
        let feed = write_feed("P1,en,1,Pen,Blue pen,Writers,EUR,1,0.45\n");
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::new());
        let profile = csv_profile(feed.path().to_path_buf());

        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let run = run_once(&conn, &remote, &profile, &options).await;

        assert_eq!(run.counters.created, 1);
        assert!(remote.calls().is_empty());
        // Nothing was persisted either; a real run still sees a new product
        let snapshot = store::load_snapshot(&conn.lock().unwrap(), "BIC").unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn limit_caps_processed_records() {
        let rows: String = (0..10)
            .map(|i| format!("P{},en,1,Item {},desc,Brand,EUR,1,1.00\n", i, i))
            .collect();
        let feed = write_feed(&rows);
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::new());
        let profile = csv_profile(feed.path().to_path_buf());

        let options = RunOptions {
            limit: Some(3),
            ..RunOptions::default()
        };
        let run = run_once(&conn, &remote, &profile, &options).await;
        assert_eq!(run.counters.processed, 3);
        assert_eq!(run.state, RunState::Completed);
    }

    #[tokio::test]
    async fn zero_concurrency_is_clamped_to_one_worker() {
        let feed = write_feed(
            "P1,en,1,Pen,Blue pen,Writers,EUR,1,0.45\n\
             P2,en,1,Notebook,A5,Paper,EUR,1,1.20\n\
             P3,en,1,Pencil,HB,Writers,EUR,1,0.30\n",
        );
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::new());
        let mut profile = csv_profile(feed.path().to_path_buf());
        profile.concurrency = 0;

        let run = run_once(&conn, &remote, &profile, &RunOptions::default()).await;
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.counters.created, 3);
    }

    #[tokio::test]
    async fn external_shutdown_aborts_the_run() {
        let feed = write_feed("P1,en,1,Pen,Blue pen,Writers,EUR,1,0.45\n");
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::new());
        let profile = csv_profile(feed.path().to_path_buf());

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let engine = SyncEngine::new(
            conn.clone(),
            remote.clone() as Arc<dyn RemoteCatalog>,
            None,
        );
        let run = engine
            .run(&profile, &RunOptions::default(), rx)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Aborted);
    }

    #[tokio::test]
    async fn mapping_failures_are_recorded_not_fatal() {
        // P2 has no name in any language
        let feed = write_feed(
            "P1,en,1,Pen,Blue pen,Writers,EUR,1,0.45\n\
             P2,en,1,,No name here,Writers,EUR,1,0.45\n\
             P3,en,1,Pencil,HB,Writers,EUR,1,0.30\n",
        );
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::new());
        let profile = csv_profile(feed.path().to_path_buf());

        let run = run_once(&conn, &remote, &profile, &RunOptions::default()).await;
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.counters.created, 2);
        assert_eq!(run.counters.failed, 1);
        assert_eq!(run.errors[0].sku, "P2");
    }

    fn jpeg_bytes() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(16, 16));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn broken_images_are_skipped_not_fatal() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let cdn = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p1_front.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(jpeg_bytes(), "image/jpeg"))
            .mount(&cdn)
            .await;
        Mock::given(method("GET"))
            .and(path("/p1_imprint.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&cdn)
            .await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "productCode,language,active,name,brand,listImage,imprintTemplate,\
             price.currency,minQty.1,price.1\n\
             P1,en,1,Pen,Writers,{0}/p1_front.jpg,{0}/p1_imprint.jpg,EUR,1,0.45\n",
            cdn.uri()
        )
        .unwrap();
        let conn = test_conn();
        let remote = Arc::new(FakeRemote::new());
        let profile = csv_profile(file.path().to_path_buf());

        let run = run_once(&conn, &remote, &profile, &RunOptions::default()).await;

        // The broken URL is dropped; the product still syncs with the rest
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.counters.created, 1);
        assert_eq!(run.counters.failed, 0);
        assert!(remote
            .calls()
            .iter()
            .any(|c| c == "create_product BIC_P1 images=1"));
        // The failure is still on record for the run
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.errors[0].sku, "BIC_P1");
        assert!(run.errors[0].message.contains("p1_imprint.jpg"));
    }
}
