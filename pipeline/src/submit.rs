use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use common::{AnalysisResult, InternalRequest};
use errors::Result;
use log::warn;
use md5::Md5;
use metrics::counter;
use queue::Delivery;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::context::Ctx;

/// Exchange the final result envelopes are published on.
const RESULTS_EXCHANGE: &str = "totem";

/// Starts the submit stage: collects results for completed tasks,
/// hashes the sample and publishes the envelope for downstream
/// consumers.
pub async fn run(ctx: Arc<Ctx>) -> Result<()> {
    ctx.bus.declare(&ctx.config.results_queue).await?;

    let mut messages = ctx
        .consume(&ctx.config.submit_queue(), ctx.config.submit_prefetch_count)
        .await?;

    tokio::spawn(async move {
        while let Some(msg) = messages.recv().await {
            let req: InternalRequest = match serde_json::from_slice(&msg.payload) {
                Ok(req) => req,
                Err(e) => {
                    ctx.fail(&msg, &e.into(), "Could not decode json!").await;
                    continue;
                }
            };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                submit_results(ctx, req, msg).await;
            });
        }
        warn!("Submit consumer channel closed");
    });

    Ok(())
}

pub(crate) async fn submit_results(ctx: Arc<Ctx>, req: InternalRequest, msg: Delivery) {
    let analyzer = ctx.analyzers.analyzer(&req.service, &req.url);

    let results = match analyzer.task_results(&req.task_id).await {
        Ok(r) => r,
        Err(e) => {
            ctx.fail(&msg, &e, "Could not get results").await;
            ctx.discard_sample(&req).await;
            return;
        }
    };

    // Downstream consumers expect the analyzer's report re-encoded as
    // a string inside the envelope.
    let data = match serde_json::to_string(&results.results) {
        Ok(d) => d,
        Err(e) => {
            ctx.fail(&msg, &e.into(), "Could not encode analyzer results")
                .await;
            ctx.discard_sample(&req).await;
            return;
        }
    };

    let staged = Path::new(&ctx.config.scratch_dir).join(&req.file_path);
    let file_bytes = if req.original_request.download {
        match tokio::fs::read(&staged).await {
            Ok(bytes) => bytes,
            Err(e) => {
                ctx.fail(&msg, &e.into(), "Could not read sample file").await;
                return;
            }
        }
    } else if ctx.config.legacy_url_hashing {
        // Historical quirk kept for wire compatibility: the hash
        // covers the scratch path string, not the sample itself.
        staged.to_string_lossy().into_owned().into_bytes()
    } else {
        req.file_path.clone().into_bytes()
    };

    let envelope = AnalysisResult {
        filename: req.original_request.filename.clone(),
        data,
        md5: hex::encode(Md5::digest(&file_bytes)),
        sha1: hex::encode(Sha1::digest(&file_bytes)),
        sha256: hex::encode(Sha256::digest(&file_bytes)),
        service_name: req.service.clone(),
        tags: req.original_request.tags.clone(),
        comment: req.original_request.comment.clone(),
        started_date_time: req.started,
        finished_date_time: Utc::now(),
    };

    let body = match serde_json::to_vec(&envelope) {
        Ok(b) => b,
        Err(e) => {
            ctx.fail(&msg, &e.into(), "Could not marshal final result")
                .await;
            ctx.discard_sample(&req).await;
            return;
        }
    };

    let routing_key = format!("{}.result.static.totem", req.service);
    if let Err(e) = ctx
        .bus
        .publish_routed(RESULTS_EXCHANGE, &routing_key, &body)
        .await
    {
        ctx.fail(&msg, &e, "Could not publish result").await;
        ctx.discard_sample(&req).await;
        return;
    }

    ctx.finish(&msg).await;
    counter!("submit_results_total", "service" => req.service.clone()).increment(1);

    // Cleanup time. The results are out, so a leftover file is only
    // worth a warning.
    if let Err(e) = tokio::fs::remove_file(&staged).await {
        warn!("Could not delete file {}: {}", req.file_path, e);
    }
}
