use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{ExternalRequest, InternalRequest};
use errors::Result;
use log::{debug, warn};
use metrics::counter;
use queue::Delivery;
use rand::Rng;

use crate::context::Ctx;
use crate::fetch;

/// Starts the feed stage: consumes external requests from the ingress
/// queue, admits them against analyzer capacity and hands live tasks
/// over to check.
pub async fn run(ctx: Arc<Ctx>) -> Result<()> {
    ctx.bus.declare(&ctx.config.check_queue()).await?;

    let mut messages = ctx
        .consume(&ctx.config.consume_queue, ctx.config.feed_prefetch_count)
        .await?;

    tokio::spawn(async move {
        while let Some(msg) = messages.recv().await {
            debug!("Received a message on {}", msg.queue);
            parse_msg(ctx.clone(), msg).await;
        }
        warn!("Feed consumer channel closed");
    });

    Ok(())
}

/// Decodes an ingress delivery and fans it out: one concurrent handler
/// per service named in the request. A service the node does not know
/// is skipped with a warning, it does not fail the whole message.
pub(crate) async fn parse_msg(ctx: Arc<Ctx>, msg: Delivery) {
    let req: ExternalRequest = match serde_json::from_slice(&msg.payload) {
        Ok(req) => req,
        Err(e) => {
            ctx.fail(&msg, &e.into(), "Could not decode json!").await;
            return;
        }
    };

    if let Err(e) = req.validate() {
        ctx.fail(&msg, &e, "Could not validate msg").await;
        return;
    }

    for service in req.tasks.keys() {
        let Some(urls) = ctx.config.services.get(service) else {
            warn!("Service {} is not existing on this node", service);
            continue;
        };
        if urls.is_empty() {
            warn!("Service {} is configured without URLs", service);
            continue;
        }

        let url = urls[rand::rng().random_range(0..urls.len())].clone();

        let ctx = ctx.clone();
        let req = req.clone();
        let service = service.clone();
        let msg = msg.clone();
        tokio::spawn(async move {
            handle_feeding(ctx, req, service, url, msg).await;
        });
    }
}

/// Runs one analysis admission end to end: waits for a free slot on
/// the analyzer, stages the sample, starts the task and publishes the
/// internal request towards check. Every terminal error nacks the
/// ingress delivery; the shared settle guard keeps concurrent sibling
/// handlers from settling it twice.
pub(crate) async fn handle_feeding(
    ctx: Arc<Ctx>,
    req: ExternalRequest,
    service: String,
    url: String,
    msg: Delivery,
) {
    let analyzer = ctx.analyzers.analyzer(&service, &url);

    let mut status = match analyzer.status().await {
        Ok(s) => s,
        Err(e) => {
            ctx.fail(&msg, &e, "Could not get analyzer status").await;
            return;
        }
    };

    // Admission control: hold the message until the analyzer reports
    // capacity. FreeSlots <= 0 means no admissions.
    while status.free_slots <= 0 {
        debug!("Slowdown: no free slots on {}", service);
        tokio::time::sleep(Duration::from_secs(ctx.config.slot_wait_seconds)).await;

        status = match analyzer.status().await {
            Ok(s) => s,
            Err(e) => {
                ctx.fail(&msg, &e, "Could not get analyzer status").await;
                return;
            }
        };
    }

    let sample = if req.download {
        let scratch = Path::new(&ctx.config.scratch_dir);
        match fetch::fetch_sample(&ctx.http, &req.primary_uri, scratch).await {
            Ok(name) => name,
            Err(e) => {
                let desc = format!("Downloading the file from {} failed", req.primary_uri);
                ctx.fail(&msg, &e, &desc).await;
                return;
            }
        }
    } else {
        // The filename is the sample data; the analyzer interprets it,
        // the pipeline never dereferences it.
        req.filename.clone()
    };

    let started = Utc::now();
    let task = match analyzer.new_task(&sample).await {
        Ok(t) => t,
        Err(e) => {
            ctx.fail(&msg, &e, "Feeding sample to analyzer failed").await;
            fetch::discard(&ctx.config.scratch_dir, &sample, req.download).await;
            return;
        }
    };

    let internal = InternalRequest {
        service,
        url,
        task_id: task.task_id,
        file_path: sample,
        started,
        original_request: req,
    };

    let body = match serde_json::to_vec(&internal) {
        Ok(b) => b,
        Err(e) => {
            ctx.fail(&msg, &e.into(), "Could not create internal request!")
                .await;
            ctx.discard_sample(&internal).await;
            return;
        }
    };

    if let Err(e) = ctx.bus.publish(&ctx.config.check_queue(), &body).await {
        ctx.fail(&msg, &e, "Could not publish to check queue").await;
        ctx.discard_sample(&internal).await;
        return;
    }

    ctx.finish(&msg).await;
    counter!("feed_tasks_total", "service" => internal.service).increment(1);
}
