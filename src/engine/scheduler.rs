use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use crate::core::UploadId;
use super::EngineInner;
use super::state::ActiveUpload;
use super::worker;

/// Outcome of one attempt to move queued work into a slot
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Activation {
    Started(UploadId),
    /// Runnable work exists but every slot is taken
    Full,
    /// Nothing runnable in the queue
    Idle,
}

impl EngineInner {
    pub(crate) fn max_concurrent(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    /// Spawns a scheduling pass. Passes queue up on `pass_lock`, so calling
    /// this while a pass is running never loses work.
    pub(crate) fn trigger_pass(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move { engine.scheduling_pass().await });
    }

    pub(crate) fn touch_pass(&self) {
        *self.last_pass_activity.lock() = Instant::now();
    }

    pub(crate) async fn scheduling_pass(self: &Arc<Self>) {
        let _guard = self.pass_lock.lock().await;
        let token = self.shutdown.child_token();
        *self.current_pass.lock() = Some(token.clone());
        self.touch_pass();

        loop {
            if token.is_cancelled() {
                debug!("Scheduling pass stopped");
                break;
            }

            // Registered before the slot check so a worker finishing in
            // between still wakes this pass
            let slot_freed = self.slot_freed.notified();

            match self.try_activate_next() {
                Activation::Started(_) => self.touch_pass(),
                Activation::Idle => break,
                Activation::Full => {
                    tokio::select! {
                        _ = slot_freed => {}
                        _ = tokio::time::sleep(self.config.slot_poll_interval()) => {}
                        _ = token.cancelled() => {}
                    }
                    self.touch_pass();
                }
            }
        }

        self.current_pass.lock().take();
    }

    /// Moves the first runnable queued upload into the active set and starts
    /// its worker, if a slot is free.
    pub(crate) fn try_activate_next(self: &Arc<Self>) -> Activation {
        let mut state = self.state.lock();
        let Some(position) = state.next_runnable() else {
            return Activation::Idle;
        };
        if state.in_flight() >= self.max_concurrent() {
            return Activation::Full;
        }

        let Some(upload_id) = state.queued.remove(position) else {
            return Activation::Idle;
        };
        let Some(queued) = state.pending.remove(&upload_id) else {
            return Activation::Idle;
        };

        let mut active = ActiveUpload::activate(queued, self.config.progress_interval());
        self.spawn_worker(&mut active);
        self.events.status(active.progress());
        info!(
            upload_id = %upload_id,
            chunk = active.current_chunk,
            total_chunks = active.record.total_chunks(),
            "Upload started"
        );
        state.active.insert(upload_id.clone(), active);

        Activation::Started(upload_id)
    }

    /// Starts a worker run for `active`. The run is a child of the upload's
    /// cancel context, so pausing stops only this run.
    pub(crate) fn spawn_worker(self: &Arc<Self>, active: &mut ActiveUpload) {
        let run = active.record.cancel.child();
        active.run = Some(run.clone());
        active.paused = false;
        active.sampler.reset(active.uploaded_bytes);
        tokio::spawn(worker::run(self.clone(), active.record.upload_id().clone(), run));
    }

    /// Called after a record leaves the active set or stops counting against it.
    pub(crate) fn release_slot(self: &Arc<Self>) {
        self.slot_freed.notify_waiters();
        self.trigger_pass();
    }

    /// Restarts the scheduling pass when runnable work is waiting for a free
    /// slot and no pass made progress within the stall threshold.
    pub(crate) fn watchdog_check(self: &Arc<Self>) -> bool {
        let stall = self.config.watchdog_stall();
        let (waiting, silent) = {
            let state = self.state.lock();
            let silent = state
                .active
                .values()
                .filter(|active| active.is_in_flight() && active.last_progress_time.elapsed() >= stall)
                .count();
            (state.has_runnable() && state.in_flight() < self.max_concurrent(), silent)
        };
        if silent > 0 {
            debug!(uploads = silent, "Uploads without progress since the last watchdog check");
        }
        if !waiting {
            return false;
        }

        let idle_for = self.last_pass_activity.lock().elapsed();
        if idle_for < stall {
            return false;
        }

        warn!(idle_secs = idle_for.as_secs(), "Scheduler stalled with queued uploads, restarting pass");
        if let Some(token) = self.current_pass.lock().take() {
            token.cancel();
        }
        self.touch_pass();
        self.trigger_pass();
        true
    }
}

pub(crate) fn spawn_watchdog(engine: &Arc<EngineInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(engine);
    let period = engine.config.watchdog_interval();
    let shutdown = engine.shutdown.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(engine) = weak.upgrade() else {
                break;
            };
            engine.watchdog_check();
        }
        debug!("Watchdog stopped");
    })
}

