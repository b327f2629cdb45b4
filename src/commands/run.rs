use std::sync::Arc;

use alarmd_core::{
    AlarmQueue, AlarmdConfig, Clock, LiveClock, RangePlanner, TokioWakeupTimer, WakeupTimer,
    WindowTracker,
};
use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::render::Render;

pub async fn run(config: AlarmdConfig) -> Result<()> {
    let tz = super::timezone(&config)?;
    let engine = super::build_engine(&config, tz)?;

    let clock: Arc<dyn Clock> = Arc::new(LiveClock::new(tz, config.clock));
    let timer: Arc<dyn WakeupTimer> = Arc::new(TokioWakeupTimer::new(Arc::clone(&clock)));

    let planner = RangePlanner::new(engine.clone(), tz);
    let queue = AlarmQueue::new(planner.appointments(), Arc::clone(&clock), timer);
    let mut alarms = queue.subscribe();
    let _tracker = WindowTracker::spawn(&planner, Arc::clone(&clock), config.window)?;

    info!(timezone = %tz, "alarmd running");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            reached = alarms.recv() => match reached {
                Ok(reached) => println!("{}", reached.render()),
                Err(RecvError::Lagged(n)) => warn!(missed = n, "alarm output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown();
    Ok(())
}
