use std::sync::Arc;
use std::time::Duration;

use analyzer::Analyzer;
use common::InternalRequest;
use dashmap::DashMap;
use errors::Result;
use errors::error::AnalyzerError;
use log::warn;
use metrics::gauge;
use queue::Delivery;

use crate::context::Ctx;

/// One task being polled for completion. The delivery stays unacked
/// while the entry lives; check owns it until the task finishes or
/// fails.
pub(crate) struct WatchEntry {
    pub req: InternalRequest,
    pub msg: Delivery,
    pub analyzer: Arc<dyn Analyzer>,
}

/// In-flight tasks keyed by the staged sample's file path.
pub(crate) type WatchMap = Arc<DashMap<String, WatchEntry>>;

/// Starts the check stage: an intake worker filling the watch set and
/// a poll loop draining it towards submit.
pub async fn run(ctx: Arc<Ctx>) -> Result<()> {
    ctx.bus.declare(&ctx.config.submit_queue()).await?;

    let watch: WatchMap = Arc::new(DashMap::new());

    let mut messages = ctx
        .consume(&ctx.config.check_queue(), ctx.config.check_prefetch_count)
        .await?;

    let intake_ctx = ctx.clone();
    let intake_watch = watch.clone();
    tokio::spawn(async move {
        while let Some(msg) = messages.recv().await {
            parse_msg(&intake_ctx, &intake_watch, msg).await;
        }
        warn!("Check consumer channel closed");
    });

    tokio::spawn(async move {
        let wait = Duration::from_secs(ctx.config.wait_between_requests);
        loop {
            // An empty watch set must not spin at full load.
            tokio::time::sleep(wait).await;
            sweep(&ctx, &watch).await;
        }
    });

    Ok(())
}

/// Puts a fresh internal request under watch. The delivery is not
/// acked here. A colliding file path means an equivalent task was
/// re-driven; the newer delivery simply replaces the entry.
pub(crate) async fn parse_msg(ctx: &Arc<Ctx>, watch: &WatchMap, msg: Delivery) {
    let req: InternalRequest = match serde_json::from_slice(&msg.payload) {
        Ok(req) => req,
        Err(e) => {
            ctx.fail(&msg, &e.into(), "Could not decode json!").await;
            return;
        }
    };

    let analyzer = ctx.analyzers.analyzer(&req.service, &req.url);
    watch.insert(req.file_path.clone(), WatchEntry { req, msg, analyzer });
    gauge!("check_watched_tasks").set(watch.len() as f64);
}

/// One pass over the watch set. Polls are spaced WaitBetweenRequests
/// apart, so the poll rate against the back-ends stays flat no matter
/// how many tasks are in flight.
pub(crate) async fn sweep(ctx: &Arc<Ctx>, watch: &WatchMap) {
    let wait = Duration::from_secs(ctx.config.wait_between_requests);
    let keys: Vec<String> = watch.iter().map(|entry| entry.key().clone()).collect();

    for key in keys {
        tokio::time::sleep(wait).await;

        // Clone what the poll needs so no map lock is held across an
        // await; intake may insert concurrently.
        let Some((req, msg, analyzer)) = watch
            .get(&key)
            .map(|entry| (entry.req.clone(), entry.msg.clone(), entry.analyzer.clone()))
        else {
            continue;
        };

        let check = match analyzer.check_task(&req.task_id).await {
            Ok(check) => check,
            Err(e) => {
                let desc = if is_reported(&e) {
                    "Checking task returned an error!"
                } else {
                    "Couldn't get status of task!"
                };
                ctx.fail(&msg, &e, desc).await;
                ctx.discard_sample(&req).await;
                watch.remove(&key);
                continue;
            }
        };

        if !check.done {
            continue;
        }

        // Task is done, hand it to submit and release the delivery.
        let body = match serde_json::to_vec(&req) {
            Ok(b) => b,
            Err(e) => {
                ctx.fail(&msg, &e.into(), "Could not create internal request!")
                    .await;
                ctx.discard_sample(&req).await;
                watch.remove(&key);
                continue;
            }
        };

        if let Err(e) = ctx.bus.publish(&ctx.config.submit_queue(), &body).await {
            ctx.fail(&msg, &e, "Could not publish to submit queue").await;
            ctx.discard_sample(&req).await;
            watch.remove(&key);
            continue;
        }

        ctx.finish(&msg).await;
        watch.remove(&key);
        gauge!("check_watched_tasks").set(watch.len() as f64);
    }
}

/// A task-level error reported by the back-end, as opposed to a
/// transport failure reaching it.
fn is_reported(err: &errors::Error) -> bool {
    use std::error::Error as _;
    matches!(
        err.source().and_then(|s| s.downcast_ref::<AnalyzerError>()),
        Some(AnalyzerError::Reported(_))
    )
}
