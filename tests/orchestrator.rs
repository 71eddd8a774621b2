//! End-to-end runs against the in-memory store and a scripted model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use modtrans::{
    AppConfig, EventSender, GenerateRequest, GenerateResponse, LlmClient, MemoryStore,
    ProjectStore, RowRecord, RowStatus, RunControl, RunOptions, TmKey, TranslateError,
    TranslationService,
};

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    /// Answer every prompt with a marked translation.
    Translate,
    /// Fail whole-batch JSON requests; single text requests succeed.
    FailBatchJson,
    /// Every request fails with an invalid-key error.
    CredentialFail,
    /// The model must never be called.
    Unreachable,
}

struct ScriptedClient {
    mode: Mode,
    calls: AtomicUsize,
    deletes: AtomicUsize,
    cancel_plan: Mutex<Option<(usize, RunControl)>>,
}

impl ScriptedClient {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            cancel_plan: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Cancels the run from inside the model once `calls` requests came in.
    fn cancel_on_call(&self, calls: usize, control: RunControl) {
        *self.cancel_plan.lock().unwrap() = Some((calls, control));
    }

    fn answer_batch(&self, prompt: &str) -> GenerateResponse {
        let payload_start = prompt.find("Input JSON:").map(|i| i + "Input JSON:".len());
        let payload: Value = payload_start
            .and_then(|start| serde_json::from_str(prompt[start..].trim()).ok())
            .unwrap_or_else(|| json!({ "items": [] }));
        let translations: Vec<Value> = payload["items"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|item| {
                json!({
                    "id": item["id"],
                    "text": format!("{} 번역", item["text"].as_str().unwrap_or_default()),
                })
            })
            .collect();
        GenerateResponse {
            candidates: vec![json!({ "translations": translations }).to_string()],
        }
    }

    fn answer_text(&self, prompt: &str) -> GenerateResponse {
        let body = prompt
            .split("<<<TEXT\n")
            .nth(1)
            .and_then(|rest| rest.split("\nTEXT>>>").next())
            .unwrap_or_default();
        GenerateResponse {
            candidates: vec![format!("번역: {body}")],
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn generate(&self, request: &GenerateRequest) -> modtrans::Result<GenerateResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((threshold, control)) = &*self.cancel_plan.lock().unwrap() {
            if call >= *threshold {
                control.cancel();
            }
        }
        match self.mode {
            Mode::CredentialFail => Err(TranslateError::Api {
                status: 401,
                message: "API key not valid".into(),
                retry_after: None,
            }),
            Mode::Unreachable => Err(TranslateError::Translation(
                "model called unexpectedly".into(),
            )),
            Mode::FailBatchJson if request.response_schema.is_some() => Err(TranslateError::Api {
                status: 500,
                message: "internal".into(),
                retry_after: None,
            }),
            _ if request.prompt.contains("Input JSON:") => Ok(self.answer_batch(&request.prompt)),
            _ => Ok(self.answer_text(&request.prompt)),
        }
    }

    async fn count_tokens(&self, text: &str) -> modtrans::Result<u32> {
        Ok(text.len() as u32 / 4)
    }

    async fn create_cached_content(&self, _sys: &str, _ttl: u64) -> modtrans::Result<String> {
        Ok("cachedContents/test".into())
    }

    async fn delete_cached_content(&self, _name: &str) -> modtrans::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

fn row(id: i64, source: &str, rec: &str, edid: &str) -> RowRecord {
    RowRecord {
        id,
        source: source.to_string(),
        dest: None,
        status: RowStatus::Pending,
        rec: Some(rec.to_string()),
        edid: Some(edid.to_string()),
        order: id,
        error: None,
    }
}

fn config() -> AppConfig {
    AppConfig {
        run: RunOptions {
            max_concurrency: 2,
            max_retries: 0,
            ..RunOptions::default()
        },
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn batch_run_translates_and_fans_out_duplicates() {
    let store = Arc::new(MemoryStore::with_rows([
        row(1, "Iron Sword", "WEAP:FULL", "WeapIron01"),
        row(2, "Iron Axe", "WEAP:FULL", "WeapIron02"),
        row(3, "Iron Sword", "WEAP:FULL", "WeapIron03"),
    ]));
    let client = ScriptedClient::new(Mode::Translate);
    let service = TranslationService::new(store.clone(), client.clone(), config());

    let report = service
        .translate_ids(&[1, 2, 3], EventSender::disabled())
        .await
        .unwrap();
    assert_eq!(report.translated, 3);
    assert_eq!(report.failed, 0);

    for id in [1, 2, 3] {
        let row = store.row(id).unwrap();
        assert_eq!(row.status, RowStatus::Done, "row {id}");
        assert!(row.dest.as_deref().unwrap().contains("번역"));
    }
    // The duplicate reuses the canonical translation without its own call.
    assert_eq!(store.row(3).unwrap().dest, store.row(1).unwrap().dest);
    assert!(client.calls() >= 1);

    // Finished rows land in translation memory.
    let key = TmKey::new("english", "korean", "Iron Sword");
    assert!(store.tm_lookup(&key).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_batch_splits_down_to_single_rows() {
    let store = Arc::new(MemoryStore::with_rows([
        row(1, "Iron Sword", "WEAP:FULL", "WeapIron01"),
        row(2, "Iron Axe", "WEAP:FULL", "WeapIron02"),
    ]));
    let client = ScriptedClient::new(Mode::FailBatchJson);
    let service = TranslationService::new(store.clone(), client.clone(), config());

    let report = service
        .translate_ids(&[1, 2], EventSender::disabled())
        .await
        .unwrap();
    assert_eq!(report.translated, 2);
    assert_eq!(store.row(1).unwrap().status, RowStatus::Done);
    assert_eq!(store.row(2).unwrap().status, RowStatus::Done);
    // One failed batch call plus one text call per row.
    assert!(client.calls() >= 3);
}

#[tokio::test]
async fn credential_failure_aborts_and_reverts_rows() {
    let store = Arc::new(MemoryStore::with_rows([
        row(1, "Iron Sword", "WEAP:FULL", "WeapIron01"),
        row(2, "Iron Axe", "WEAP:FULL", "WeapIron02"),
    ]));
    let client = ScriptedClient::new(Mode::CredentialFail);
    let service = TranslationService::new(store.clone(), client, config());

    let err = service
        .translate_ids(&[1, 2], EventSender::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, TranslateError::Api { status: 401, .. }));

    // Nothing stays stuck in progress and nothing is marked failed.
    assert_eq!(store.row(1).unwrap().status, RowStatus::Pending);
    assert_eq!(store.row(2).unwrap().status, RowStatus::Pending);
}

#[tokio::test]
async fn cancellation_keeps_done_rows_and_leaves_the_rest_pending() {
    let store = Arc::new(MemoryStore::with_rows([
        row(1, "Sharpened Axe", "WEAP:FULL", "AxeSharp01"),
        row(2, "Heavy Maul", "WEAP:FULL", "AxeSharp02"),
        row(3, "Long Bow", "WEAP:FULL", "BowLong01"),
        row(4, "Short Bow", "WEAP:FULL", "BowLong02"),
    ]));
    let client = ScriptedClient::new(Mode::Translate);
    let mut config = config();
    config.run.max_concurrency = 1;
    let service = TranslationService::new(store.clone(), client.clone(), config);

    let run = service
        .begin(&[1, 2, 3, 4], EventSender::disabled())
        .await
        .unwrap();
    client.cancel_on_call(1, run.control());

    let err = run.run().await.unwrap_err();
    assert!(matches!(err, TranslateError::Cancelled));

    // The batch answered before the cancel stays committed.
    for id in [1, 2] {
        let row = store.row(id).unwrap();
        assert_eq!(row.status, RowStatus::Done, "row {id}");
        assert!(row.dest.as_deref().unwrap().contains("번역"));
    }
    // Undequeued batches are left untouched for the next run.
    for id in [3, 4] {
        assert_eq!(store.row(id).unwrap().status, RowStatus::Pending, "row {id}");
    }
    assert_eq!(client.calls(), 1);
}

#[tokio::test]
async fn pause_parks_workers_until_resumed() {
    let store = Arc::new(MemoryStore::with_rows([
        row(1, "Iron Sword", "WEAP:FULL", "WeapIron01"),
        row(2, "Iron Axe", "WEAP:FULL", "WeapIron02"),
    ]));
    let client = ScriptedClient::new(Mode::Translate);
    let service = TranslationService::new(store.clone(), client.clone(), config());

    let run = service.begin(&[1, 2], EventSender::disabled()).await.unwrap();
    let control = run.control();
    control.set_paused(true);
    let running = tokio::spawn(run.run());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.calls(), 0, "paused workers must not call the model");
    assert!(!running.is_finished());

    control.set_paused(false);
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.translated, 2);
    assert_eq!(store.row(1).unwrap().status, RowStatus::Done);
    assert_eq!(store.row(2).unwrap().status, RowStatus::Done);
}

#[tokio::test]
async fn credential_failure_stops_sibling_workers() {
    let store = Arc::new(MemoryStore::with_rows([
        row(1, "Axe", "WEAP:FULL", "AxeA01"),
        row(2, "Bow", "WEAP:FULL", "BowB01"),
        row(3, "Club", "WEAP:FULL", "ClubC01"),
        row(4, "Dagger", "WEAP:FULL", "DaggerD01"),
        row(5, "Mace", "WEAP:FULL", "MaceE01"),
        row(6, "Spear", "WEAP:FULL", "SpearF01"),
    ]));
    let client = ScriptedClient::new(Mode::CredentialFail);
    let service = TranslationService::new(store.clone(), client.clone(), config());

    let err = service
        .translate_ids(&[1, 2, 3, 4, 5, 6], EventSender::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, TranslateError::Api { status: 401, .. }));

    // The first failure cancels the shared token, so at most the two
    // workers' in-flight batches ever reach the model.
    assert!(client.calls() <= 2, "calls: {}", client.calls());
    for id in 1..=6 {
        assert_eq!(store.row(id).unwrap().status, RowStatus::Pending, "row {id}");
    }
}

#[tokio::test]
async fn aborted_seeding_still_tears_down_the_prompt_cache() {
    let store = Arc::new(MemoryStore::with_rows([
        row(1, "Whiterun Guard", "NPC_:FULL", "GuardWhiterun"),
        row(2, "Talk to the Whiterun Guard at the gate.", "QUST:CNAM", "GuardQuest01"),
        row(3, "Find the Whiterun Guard near the stables.", "QUST:CNAM", "GuardQuest02"),
    ]));
    let client = ScriptedClient::new(Mode::CredentialFail);
    let service = TranslationService::new(store.clone(), client.clone(), config());

    let err = service
        .translate_ids(&[1, 2, 3], EventSender::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, TranslateError::Api { status: 401, .. }));
    assert_eq!(client.deletes(), 1, "remote cached prompt must be deleted");
}

#[tokio::test]
async fn translation_memory_short_circuits_the_model() {
    let store = Arc::new(MemoryStore::with_rows([row(
        1,
        "Iron Sword",
        "WEAP:FULL",
        "WeapIron01",
    )]));
    let key = TmKey::new("english", "korean", "Iron Sword");
    store.seed_tm(&key, "철 검");

    let client = ScriptedClient::new(Mode::Unreachable);
    let service = TranslationService::new(store.clone(), client.clone(), config());
    let report = service
        .translate_ids(&[1], EventSender::disabled())
        .await
        .unwrap();

    assert_eq!(report.tm_hits, 1);
    assert_eq!(report.translated, 1);
    assert_eq!(store.row(1).unwrap().dest.as_deref(), Some("철 검"));
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn masked_placeholders_survive_the_round_trip() {
    let store = Arc::new(MemoryStore::with_rows([row(
        1,
        "Deals <mag> damage for <dur> seconds.",
        "MGEF:DNAM",
        "EffectFire01",
    )]));
    let client = ScriptedClient::new(Mode::Translate);
    let service = TranslationService::new(store.clone(), client, config());

    let report = service
        .translate_ids(&[1], EventSender::disabled())
        .await
        .unwrap();
    assert_eq!(report.translated, 1);
    let dest = store.row(1).unwrap().dest.unwrap();
    assert!(dest.contains("<mag>"), "{dest}");
    assert!(dest.contains("<dur>"), "{dest}");
    assert!(!dest.contains("__XT_PH_"), "{dest}");
}
