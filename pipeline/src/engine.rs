use std::sync::Arc;

use errors::Result;
use log::info;

use crate::context::Ctx;
use crate::{check, feed, submit};

/// Boots the three stages. Each stage spawns its own workers and
/// returns; a startup error here is fatal for the process. The stages
/// need no runtime supervision, they recover from transient errors
/// through the failed queue.
pub async fn start(ctx: Arc<Ctx>) -> Result<()> {
    feed::run(ctx.clone()).await?;
    info!("feed running");

    check::run(ctx.clone()).await?;
    info!("check running");

    submit::run(ctx).await?;
    info!("submit running");

    Ok(())
}
