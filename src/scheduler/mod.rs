//! Run orchestration: per-run state, request gates, worker allocation
//! and the worker loop that drains the lane queues.

pub mod events;
pub mod prepare;
pub mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::llm::{
    is_credential_error, AdaptiveConcurrency, GenerateRequest, GenerateResponse, GlobalThrottle,
    LlmClient, PromptCache,
};
use crate::pipeline;
use crate::session::SessionTermMemory;
use crate::store::{ProjectStore, RowStatus, RowUpdate};
use crate::utils::{Result, RunOptions, TranslateError};

pub use events::{EventSender, RowEvent, EVENT_CHANNEL_CAPACITY};
pub use prepare::{
    build_dialogue_windows, prepare_items, DuplicateRow, PreparedItems, RowContext, WorkUnit,
    NOTE_TM_FALLBACK, NOTE_TM_HIT,
};
pub use queue::{build_queues, Batch, Lane, LaneQueues};

/// Which lane a worker drains first; the other lanes are visited in a
/// fixed fallback order once the preferred one is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanePreference {
    ShortFirst,
    LongFirst,
    VeryLongFirst,
}

impl LanePreference {
    pub fn order(self) -> [Lane; 3] {
        match self {
            LanePreference::ShortFirst => [Lane::Short, Lane::Long, Lane::VeryLong],
            LanePreference::LongFirst => [Lane::Long, Lane::Short, Lane::VeryLong],
            LanePreference::VeryLongFirst => [Lane::VeryLong, Lane::Short, Lane::Long],
        }
    }
}

/// Worker counts per lane. Without very-long work the short lane gets
/// nearly everything; with it, most workers chase the expensive rows
/// while one or two keep the cheap lanes moving.
pub fn worker_allocation(
    has_short: bool,
    has_long: bool,
    has_very_long: bool,
    max_concurrency: usize,
) -> (usize, usize, usize) {
    let max_concurrency = max_concurrency.max(1);
    if !has_very_long {
        return if has_short && has_long && max_concurrency >= 2 {
            (max_concurrency - 1, 1, 0)
        } else if has_short {
            (max_concurrency, 0, 0)
        } else {
            (0, max_concurrency, 0)
        };
    }

    let short = if has_short {
        if max_concurrency >= 5 {
            2
        } else {
            1
        }
    } else {
        0
    };
    let long = if has_long && max_concurrency.saturating_sub(short) >= 2 {
        1
    } else {
        0
    };
    let very_long = max_concurrency.saturating_sub(short + long);
    (short, long, very_long)
}

/// All mutable and shared state of one translation run. Workers hold an
/// `Arc<RunState>`; nothing here lives beyond the run.
pub struct RunState {
    pub options: RunOptions,
    pub store: Arc<dyn ProjectStore>,
    pub client: Arc<dyn LlmClient>,
    pub session: Option<Arc<SessionTermMemory>>,
    pub prompt_cache: Option<PromptCache>,
    pub adaptive: AdaptiveConcurrency,
    pub throttle: GlobalThrottle,
    pub system_instruction: String,
    pub response_schema: serde_json::Value,
    pub row_ctx: HashMap<i64, RowContext>,
    pub dialogue_ctx: HashMap<i64, String>,
    pub duplicates: HashMap<i64, Vec<DuplicateRow>>,
    pub events: EventSender,
    pub cancel: CancellationToken,
    pub queues: LaneQueues,
    pause: watch::Receiver<bool>,
    generate_gate: Semaphore,
    very_long_gate: Option<Semaphore>,
    reserved_short_slots: usize,
    reserved_long_slots: usize,
    released_short: AtomicUsize,
    released_long: AtomicUsize,
}

/// Handle the caller keeps to pause or cancel a running translation.
#[derive(Debug, Clone)]
pub struct RunControl {
    pause: watch::Sender<bool>,
    pub cancel: CancellationToken,
}

impl RunControl {
    pub fn set_paused(&self, paused: bool) {
        let _ = self.pause.send(paused);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct RunStateParams {
    pub options: RunOptions,
    pub store: Arc<dyn ProjectStore>,
    pub client: Arc<dyn LlmClient>,
    pub session: Option<Arc<SessionTermMemory>>,
    pub prompt_cache: Option<PromptCache>,
    pub system_instruction: String,
    pub prepared: PreparedItems,
    pub queues: LaneQueues,
    pub events: EventSender,
}

impl RunState {
    pub fn new(params: RunStateParams) -> (Arc<Self>, RunControl) {
        let RunStateParams {
            options,
            store,
            client,
            session,
            prompt_cache,
            system_instruction,
            prepared,
            queues,
            events,
        } = params;

        let max_concurrency = options.max_concurrency.max(1);
        let has_short = queues.remaining(Lane::Short) > 0;
        let has_long = queues.remaining(Lane::Long) > 0;
        let has_very_long = queues.remaining(Lane::VeryLong) > 0;

        // The very-long gate keeps huge requests from starving the cheap
        // lanes; it only exists when there is real contention to manage.
        let (very_long_gate, reserved_short_slots, reserved_long_slots) =
            if has_very_long && max_concurrency >= 3 {
                let reserved_short = usize::from(has_short);
                let reserved_long = usize::from(has_long);
                (
                    Some(Semaphore::new(
                        max_concurrency - reserved_short - reserved_long,
                    )),
                    reserved_short,
                    reserved_long,
                )
            } else {
                (None, 0, 0)
            };

        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let adaptive = AdaptiveConcurrency::new(max_concurrency, options.adaptive_concurrency);

        let state = Arc::new(Self {
            adaptive,
            throttle: GlobalThrottle::new(),
            system_instruction,
            response_schema: pipeline::prompt::response_schema(),
            row_ctx: prepared.row_ctx,
            dialogue_ctx: prepared.dialogue_ctx,
            duplicates: prepared.duplicates,
            events,
            cancel: cancel.clone(),
            queues,
            pause: pause_rx,
            generate_gate: Semaphore::new(max_concurrency),
            very_long_gate,
            reserved_short_slots,
            reserved_long_slots,
            released_short: AtomicUsize::new(0),
            released_long: AtomicUsize::new(0),
            options,
            store,
            client,
            session,
            prompt_cache,
        });
        let control = RunControl {
            pause: pause_tx,
            cancel,
        };
        (state, control)
    }

    pub fn rec_for(&self, id: i64) -> Option<&str> {
        self.row_ctx.get(&id).and_then(|c| c.rec.as_deref())
    }

    pub fn dialogue_window_for(&self, id: i64) -> Option<&str> {
        self.dialogue_ctx.get(&id).map(String::as_str)
    }

    pub fn duplicates_of(&self, id: i64) -> &[DuplicateRow] {
        self.duplicates.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub async fn wait_if_paused(&self) -> Result<()> {
        let mut pause = self.pause.clone();
        while *pause.borrow() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TranslateError::Cancelled),
                changed = pause.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// One gated model call: global throttle, very-long lane gate,
    /// request gate, adaptive slot, in that order. Releases in reverse.
    pub async fn generate_with_gate(
        &self,
        request: &GenerateRequest,
        lane: Lane,
    ) -> Result<GenerateResponse> {
        if self.cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(TranslateError::Cancelled),
            _ = self.throttle.wait() => {}
        }

        let _lane_permit = match (&self.very_long_gate, lane) {
            (Some(gate), Lane::VeryLong) => Some(self.acquire_permit(gate).await?),
            _ => None,
        };
        let _permit = self.acquire_permit(&self.generate_gate).await?;

        // acquire's only await point is its poll sleep; the slot counter
        // is bumped synchronously, so abandoning the future here cannot
        // leak an in-flight slot.
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(TranslateError::Cancelled),
            _ = self.adaptive.acquire() => {}
        }
        let result = self.client.generate(request).await;
        if result.is_ok() {
            self.adaptive.on_success();
        }
        self.adaptive.release();
        result
    }

    async fn acquire_permit<'a>(
        &self,
        gate: &'a Semaphore,
    ) -> Result<tokio::sync::SemaphorePermit<'a>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TranslateError::Cancelled),
            permit = gate.acquire() => permit.map_err(|_| TranslateError::Cancelled),
        }
    }

    /// Once a cheap lane is fully dequeued its reserved very-long slot
    /// opens up for the expensive workers.
    fn release_reserved_slots_if_drained(&self, lane: Lane) {
        let Some(gate) = &self.very_long_gate else {
            return;
        };
        match lane {
            Lane::Short
                if self.reserved_short_slots > 0
                    && self.queues.remaining(Lane::Short) == 0
                    && self
                        .released_short
                        .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok() =>
            {
                gate.add_permits(self.reserved_short_slots);
            }
            Lane::Long
                if self.reserved_long_slots > 0
                    && self.queues.remaining(Lane::Long) == 0
                    && self
                        .released_long
                        .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok() =>
            {
                gate.add_permits(self.reserved_long_slots);
            }
            _ => {}
        }
    }
}

/// Spawns the worker pool and runs it to completion. The first
/// credential failure aborts the whole run.
pub async fn run_workers(state: Arc<RunState>) -> Result<()> {
    let has_short = state.queues.remaining(Lane::Short) > 0;
    let has_long = state.queues.remaining(Lane::Long) > 0;
    let has_very_long = state.queues.remaining(Lane::VeryLong) > 0;
    if !has_short && !has_long && !has_very_long {
        return Ok(());
    }

    let (short, long, very_long) = worker_allocation(
        has_short,
        has_long,
        has_very_long,
        state.options.max_concurrency,
    );
    tracing::info!(short, long, very_long, "workers allocated");

    let mut handles = Vec::with_capacity(short + long + very_long);
    for (count, preference) in [
        (short, LanePreference::ShortFirst),
        (long, LanePreference::LongFirst),
        (very_long, LanePreference::VeryLongFirst),
    ] {
        for _ in 0..count {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(worker_loop(state, preference)));
        }
    }

    // A fatal worker cancels its siblings, so plain Cancelled results
    // must not mask the error that caused them.
    let mut first_error: Option<TranslateError> = None;
    let mut record = |err: TranslateError| match &first_error {
        None => first_error = Some(err),
        Some(TranslateError::Cancelled) if !matches!(err, TranslateError::Cancelled) => {
            first_error = Some(err)
        }
        Some(_) => {}
    };
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => record(err),
            Err(join_err) => record(TranslateError::Translation(format!(
                "worker panicked: {join_err}"
            ))),
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn worker_loop(state: Arc<RunState>, preference: LanePreference) -> Result<()> {
    loop {
        if state.cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }
        let Some(batch) = dequeue(&state, preference) else {
            return Ok(());
        };
        let lane = batch.lane;
        state.release_reserved_slots_if_drained(lane);
        state.wait_if_paused().await?;

        let ids: Vec<i64> = batch.units.iter().map(|u| u.id).collect();
        mark_in_progress(&state, &batch).await?;
        let outcome = pipeline::batch::translate_batch_with_split(&state, batch.units, lane).await;

        if let Some(session) = &state.session {
            session.flush_to_glossary(state.store.as_ref()).await?;
        }

        if let Err(err) = outcome {
            if matches!(err, TranslateError::Cancelled) || is_credential_error(&err) {
                if is_credential_error(&err) {
                    // Fatal for the whole run; stop the sibling workers
                    // instead of letting each fail on its own.
                    state.cancel.cancel();
                }
                revert_batch_to_pending(&state, &ids).await?;
                return Err(err);
            }
            // The pipeline persists per-row failures itself; anything
            // reaching here left rows stuck in progress.
            tracing::error!(error = %err, lane = lane.as_str(), "batch failed");
            fail_unfinished_rows(&state, &ids, &err).await?;
        }
    }
}

/// Marks still-in-progress rows of a failed batch as Error.
async fn fail_unfinished_rows(
    state: &RunState,
    ids: &[i64],
    err: &TranslateError,
) -> Result<()> {
    let rows = state.store.rows_by_ids(ids).await?;
    let updates: Vec<RowUpdate> = rows
        .iter()
        .filter(|row| row.status == RowStatus::InProgress)
        .map(|row| RowUpdate::failed(row.id, crate::llm::format_error(err)))
        .collect();
    if updates.is_empty() {
        return Ok(());
    }
    state.store.apply_updates(&updates).await?;
    for update in updates {
        state.events.send(RowEvent {
            row_id: update.id,
            status: update.status,
            dest: None,
            error: update.error,
        });
    }
    Ok(())
}

fn dequeue(state: &RunState, preference: LanePreference) -> Option<Batch> {
    preference
        .order()
        .into_iter()
        .find_map(|lane| state.queues.pop(lane))
}

/// Marks a batch and its duplicates in-progress before the model call.
async fn mark_in_progress(state: &RunState, batch: &Batch) -> Result<()> {
    let mut updates = Vec::with_capacity(batch.units.len());
    for unit in &batch.units {
        updates.push(RowUpdate::status_only(unit.id, RowStatus::InProgress));
        for dup in state.duplicates_of(unit.id) {
            updates.push(RowUpdate::status_only(dup.id, RowStatus::InProgress));
        }
    }
    state.store.apply_updates(&updates).await?;
    for update in &updates {
        state
            .events
            .send(RowEvent::status(update.id, RowStatus::InProgress));
    }
    Ok(())
}

/// Puts a batch (and its duplicates) back to Pending, used when a
/// credential error aborts the run mid-batch.
pub async fn revert_batch_to_pending(state: &RunState, ids: &[i64]) -> Result<()> {
    let mut updates = Vec::with_capacity(ids.len());
    for &id in ids {
        updates.push(RowUpdate::status_only(id, RowStatus::Pending));
        for dup in state.duplicates_of(id) {
            updates.push(RowUpdate::status_only(dup.id, RowStatus::Pending));
        }
    }
    state.store.apply_updates(&updates).await?;
    for update in &updates {
        state
            .events
            .send(RowEvent::status(update.id, RowStatus::Pending));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::store::MemoryStore;

    use super::*;

    struct IdleClient;

    #[async_trait::async_trait]
    impl LlmClient for IdleClient {
        async fn generate(&self, _request: &GenerateRequest) -> Result<GenerateResponse> {
            Ok(GenerateResponse {
                candidates: vec!["ok".into()],
            })
        }

        async fn count_tokens(&self, text: &str) -> Result<u32> {
            Ok(text.len() as u32)
        }

        async fn create_cached_content(&self, _sys: &str, _ttl: u64) -> Result<String> {
            Ok("cachedContents/idle".into())
        }

        async fn delete_cached_content(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn model_name(&self) -> &str {
            "idle"
        }
    }

    fn gated_state(max_concurrency: usize) -> (Arc<RunState>, RunControl) {
        let options = RunOptions {
            max_concurrency,
            ..RunOptions::default()
        };
        RunState::new(RunStateParams {
            options: options.clone(),
            store: Arc::new(MemoryStore::new()),
            client: Arc::new(IdleClient),
            session: None,
            prompt_cache: None,
            system_instruction: String::new(),
            prepared: PreparedItems::default(),
            queues: build_queues(Vec::new(), &options),
            events: EventSender::disabled(),
        })
    }

    fn spawn_gated_call(
        state: &Arc<RunState>,
    ) -> tokio::task::JoinHandle<Result<GenerateResponse>> {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            state
                .generate_with_gate(&GenerateRequest::default(), Lane::Short)
                .await
        })
    }

    #[tokio::test]
    async fn cancel_interrupts_throttle_wait() {
        let (state, control) = gated_state(2);
        state.throttle.extend(Duration::from_secs(30));

        let call = spawn_gated_call(&state);
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.cancel();

        let result = tokio::time::timeout(Duration::from_millis(500), call)
            .await
            .expect("cancellation must interrupt the throttle wait")
            .unwrap();
        assert!(matches!(result, Err(TranslateError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_interrupts_adaptive_slot_wait() {
        let (state, control) = gated_state(2);
        // Saturate the adaptive limit so the gated call parks on a slot.
        state.adaptive.acquire().await;
        state.adaptive.acquire().await;

        let call = spawn_gated_call(&state);
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.cancel();

        let result = tokio::time::timeout(Duration::from_millis(500), call)
            .await
            .expect("cancellation must interrupt the slot wait")
            .unwrap();
        assert!(matches!(result, Err(TranslateError::Cancelled)));
    }

    #[test]
    fn allocation_without_very_long_favors_short() {
        assert_eq!(worker_allocation(true, true, false, 4), (3, 1, 0));
        assert_eq!(worker_allocation(true, false, false, 4), (4, 0, 0));
        assert_eq!(worker_allocation(false, true, false, 4), (0, 4, 0));
        assert_eq!(worker_allocation(true, true, false, 1), (1, 0, 0));
    }

    #[test]
    fn allocation_with_very_long_reserves_cheap_lanes() {
        assert_eq!(worker_allocation(true, true, true, 8), (2, 1, 5));
        assert_eq!(worker_allocation(true, true, true, 4), (1, 1, 2));
        assert_eq!(worker_allocation(true, false, true, 2), (1, 0, 1));
        assert_eq!(worker_allocation(false, false, true, 3), (0, 0, 3));
        assert_eq!(worker_allocation(true, true, true, 3), (1, 1, 1));
    }

    #[test]
    fn preference_orders() {
        assert_eq!(
            LanePreference::VeryLongFirst.order(),
            [Lane::VeryLong, Lane::Short, Lane::Long]
        );
        assert_eq!(
            LanePreference::LongFirst.order(),
            [Lane::Long, Lane::Short, Lane::VeryLong]
        );
    }
}
