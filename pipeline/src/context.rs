use std::sync::Arc;

use analyzer::AnalyzerProvider;
use common::Config;
use errors::{Error, Result};
use log::warn;
use queue::{BusBackend, Delivery};
use tokio::sync::mpsc;

/// Shared context threaded through the stages: the configuration, the
/// bus, the analyzer factory, and the one pooled HTTP client used for
/// sample downloads.
pub struct Ctx {
    pub config: Arc<Config>,
    pub bus: Arc<dyn BusBackend>,
    pub analyzers: Arc<dyn AnalyzerProvider>,
    pub http: reqwest::Client,
}

impl Ctx {
    /// Starts consuming `queue` with at most `prefetch` unsettled
    /// deliveries buffered at a time.
    pub async fn consume(&self, queue: &str, prefetch: usize) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(prefetch.max(1));
        self.bus.subscribe(queue, prefetch, tx).await?;
        Ok(rx)
    }

    /// Terminal failure path for a delivery: the error lands on the
    /// failed queue together with `desc` and the original body, then
    /// the delivery is settled without requeue.
    pub(crate) async fn fail(&self, msg: &Delivery, err: &Error, desc: &str) {
        warn!("[NACK] {} {}", desc, err);
        if let Err(e) = msg.nack(&error_text(err), desc).await {
            warn!("Sending NACK failed! {}", e);
        }
    }

    /// Acknowledges the delivery. A failed ack is only logged; the bus
    /// redelivers and the handler must stay idempotent.
    pub(crate) async fn finish(&self, msg: &Delivery) {
        if let Err(e) = msg.ack().await {
            warn!("Sending ACK failed! {}", e);
        }
    }

    /// Drops the staged sample of a request that just reached a
    /// terminal state, so no scratch files outlive their message.
    pub(crate) async fn discard_sample(&self, req: &common::InternalRequest) {
        crate::fetch::discard(
            &self.config.scratch_dir,
            &req.file_path,
            req.original_request.download,
        )
        .await;
    }
}

/// The failure text recorded on the failed queue: the underlying cause
/// without the wrapper's kind prefix, so a back-end that reported
/// "busy" shows up as exactly "busy".
fn error_text(err: &Error) -> String {
    use std::error::Error as _;
    err.source()
        .map(|source| source.to_string())
        .unwrap_or_else(|| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text_unwraps_the_cause() {
        let err = Error::analyzer_reported("busy");
        assert_eq!(error_text(&err), "busy");

        let err = Error::with_message(
            errors::ErrorKind::Decode,
            "request names no tasks".to_string(),
            None::<errors::BoxError>,
        );
        assert_eq!(error_text(&err), "decode error: request names no tasks");
    }
}
