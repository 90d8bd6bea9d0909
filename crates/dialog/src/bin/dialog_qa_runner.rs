use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::time::timeout;

use parley_dialog::{DialogConfig, DialogHandle, DialogState, LoadPhase, MediaLocator};
use parley_store::{
    AccountId, BoxFuture, ConversationId, ConversationRecord, FeedSubscription, MemoryBackend,
    MessageBackend, MessageId, MessageKind, MessagePage, MessagePatch, MessageRecord, NewMessage,
    PageRequest, RequestId, SenderRole, StoreError, StoreResult,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    MergeDedupe,
    PaginationWalk,
    SwitchReset,
    RetryBudget,
    FeedAccumulate,
    MutationRoundtrip,
    MediaResolve,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "merge_dedupe" => Some(Self::MergeDedupe),
            "pagination_walk" => Some(Self::PaginationWalk),
            "switch_reset" => Some(Self::SwitchReset),
            "retry_budget" => Some(Self::RetryBudget),
            "feed_accumulate" => Some(Self::FeedAccumulate),
            "mutation_roundtrip" => Some(Self::MutationRoundtrip),
            "media_resolve" => Some(Self::MediaResolve),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::MergeDedupe => "merge_dedupe",
            Self::PaginationWalk => "pagination_walk",
            Self::SwitchReset => "switch_reset",
            Self::RetryBudget => "retry_budget",
            Self::FeedAccumulate => "feed_accumulate",
            Self::MutationRoundtrip => "mutation_roundtrip",
            Self::MediaResolve => "media_resolve",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("dialog operation failed: {source}"))]
    Dialog {
        stage: &'static str,
        source: parley_dialog::DialogError,
    },
    #[snafu(display("store operation failed: {source}"))]
    Store {
        stage: &'static str,
        source: parley_store::StoreError,
    },
    #[snafu(display("timed out waiting for dialog state in scenario '{scenario}'"))]
    WaitTimeout {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    match args.scenario {
        Scenario::MergeDedupe => run_merge_dedupe().await,
        Scenario::PaginationWalk => run_pagination_walk().await,
        Scenario::SwitchReset => run_switch_reset().await,
        Scenario::RetryBudget => run_retry_budget().await,
        Scenario::FeedAccumulate => run_feed_accumulate().await,
        Scenario::MutationRoundtrip => run_mutation_roundtrip().await,
        Scenario::MediaResolve => run_media_resolve(),
        Scenario::All => run_all().await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut pending = args.into_iter();

    // The parser is intentionally strict to keep scenario execution deterministic in CI.
    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
    })
}

async fn run_all() -> RunnerResult<()> {
    run_merge_dedupe().await?;
    run_pagination_walk().await?;
    run_switch_reset().await?;
    run_retry_budget().await?;
    run_feed_accumulate().await?;
    run_mutation_roundtrip().await?;
    run_media_resolve()?;

    println!("all_passed=true");
    Ok(())
}

fn runner_config() -> DialogConfig {
    DialogConfig {
        retry_base_delay_ms: 50,
        ..DialogConfig::default()
    }
}

fn seed_history(
    backend: &MemoryBackend,
    conversation: &ConversationRecord,
    count: usize,
) -> RunnerResult<()> {
    let base = chrono::Utc::now() - chrono::Duration::minutes(count as i64);
    let records = (0..count)
        .map(|index| {
            let at = base + chrono::Duration::minutes(index as i64);
            MessageRecord {
                id: MessageId::generate(),
                conversation_id: conversation.id,
                body: format!("seeded {index}"),
                kind: MessageKind::Text,
                sender_role: SenderRole::Student,
                sender_id: conversation.student_id,
                created_at: at,
                updated_at: at,
                edited: false,
                seen: true,
            }
        })
        .collect();
    backend
        .insert_history(conversation.id, records)
        .context(StoreSnafu { stage: "seed" })
}

async fn wait_for(
    handle: &DialogHandle,
    scenario: &'static str,
    predicate: impl Fn(&DialogState) -> bool,
) -> RunnerResult<DialogState> {
    let mut watch = handle.watch();
    let outcome = timeout(Duration::from_secs(5), async {
        loop {
            if predicate(&watch.borrow()) {
                return watch.borrow().clone();
            }
            if watch.changed().await.is_err() {
                return watch.borrow().clone();
            }
        }
    })
    .await;

    outcome.map_err(|_| {
        WaitTimeoutSnafu {
            stage: "wait-for-state",
            scenario,
        }
        .build()
    })
}

fn unique_ids(state: &DialogState) -> bool {
    let mut seen = std::collections::HashSet::new();
    state.messages.iter().all(|message| seen.insert(message.id))
}

async fn run_merge_dedupe() -> RunnerResult<()> {
    let backend = Arc::new(MemoryBackend::new());
    let conversation = backend.create_conversation(
        RequestId::generate(),
        AccountId::generate(),
        AccountId::generate(),
    );
    seed_history(&backend, &conversation, 5)?;

    let handle = DialogHandle::spawn(backend.clone(), None, &runner_config());
    handle
        .select(conversation.request_id, Some(conversation.id))
        .context(DialogSnafu { stage: "select" })?;
    wait_for(&handle, "merge_dedupe", |state| {
        state.phase == LoadPhase::Ready && state.messages.len() == 5
    })
    .await?;

    // The send reply and the feed broadcast both carry the new message; the
    // merge must keep exactly one copy.
    handle
        .send_message(NewMessage::text("no duplicates"))
        .await
        .context(DialogSnafu { stage: "send" })?;
    let state = wait_for(&handle, "merge_dedupe", |state| state.messages.len() == 6).await?;

    ensure!(
        unique_ids(&state),
        ScenarioFailedSnafu {
            stage: "merge-dedupe-check",
            scenario: "merge_dedupe",
            reason: "duplicate message ids after feed merge".to_string(),
        }
    );
    println!("merged_count={}", state.messages.len());
    println!("merge_dedupe=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_pagination_walk() -> RunnerResult<()> {
    let backend = Arc::new(MemoryBackend::new());
    let conversation = backend.create_conversation(
        RequestId::generate(),
        AccountId::generate(),
        AccountId::generate(),
    );
    seed_history(&backend, &conversation, 25)?;

    let handle = DialogHandle::spawn(backend.clone(), None, &runner_config());
    handle
        .select(conversation.request_id, Some(conversation.id))
        .context(DialogSnafu { stage: "select" })?;
    let first = wait_for(&handle, "pagination_walk", |state| {
        state.phase == LoadPhase::Ready && state.messages.len() == 10
    })
    .await?;
    ensure!(
        first.has_more,
        ScenarioFailedSnafu {
            stage: "pagination-first-page",
            scenario: "pagination_walk",
            reason: "expected more history after the first page".to_string(),
        }
    );

    handle
        .load_older()
        .context(DialogSnafu { stage: "load-older" })?;
    wait_for(&handle, "pagination_walk", |state| {
        state.messages.len() == 20
    })
    .await?;

    handle
        .load_older()
        .context(DialogSnafu { stage: "load-older" })?;
    let full = wait_for(&handle, "pagination_walk", |state| {
        state.messages.len() == 25
    })
    .await?;

    ensure!(
        !full.has_more && unique_ids(&full),
        ScenarioFailedSnafu {
            stage: "pagination-exhausted",
            scenario: "pagination_walk",
            reason: "history not exhausted cleanly".to_string(),
        }
    );
    println!("pages_loaded=3");
    println!("final_count={}", full.messages.len());
    println!("runner_ok=true");
    Ok(())
}

async fn run_switch_reset() -> RunnerResult<()> {
    let backend = Arc::new(MemoryBackend::new());
    let request_id = RequestId::generate();
    let student = AccountId::generate();
    let first = backend.create_conversation(request_id, student, AccountId::generate());
    let second = backend.create_conversation(request_id, student, AccountId::generate());
    seed_history(&backend, &first, 8)?;
    seed_history(&backend, &second, 3)?;

    let handle = DialogHandle::spawn(backend.clone(), None, &runner_config());
    handle
        .select(request_id, Some(first.id))
        .context(DialogSnafu { stage: "select-first" })?;
    wait_for(&handle, "switch_reset", |state| {
        state.phase == LoadPhase::Ready && state.messages.len() == 8
    })
    .await?;

    handle
        .select(request_id, Some(second.id))
        .context(DialogSnafu {
            stage: "select-second",
        })?;
    let state = wait_for(&handle, "switch_reset", |state| {
        state.conversation_id == Some(second.id)
            && state.phase == LoadPhase::Ready
            && state.messages.len() == 3
    })
    .await?;

    let leaked = state
        .messages
        .iter()
        .any(|message| message.conversation_id != second.id);
    ensure!(
        !leaked,
        ScenarioFailedSnafu {
            stage: "switch-leak-check",
            scenario: "switch_reset",
            reason: "messages from the previous conversation leaked through".to_string(),
        }
    );

    // The old feed must detach once the subscription drops.
    let detached = timeout(Duration::from_secs(5), async {
        while backend.watcher_count(first.id) != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok();
    ensure!(
        detached,
        ScenarioFailedSnafu {
            stage: "switch-detach-check",
            scenario: "switch_reset",
            reason: "previous feed subscription never detached".to_string(),
        }
    );

    println!("old_feed_watchers={}", backend.watcher_count(first.id));
    println!("new_feed_watchers={}", backend.watcher_count(second.id));
    println!("runner_ok=true");
    Ok(())
}

async fn run_retry_budget() -> RunnerResult<()> {
    // Recovers on the third and final attempt.
    let flaky = Arc::new(FlakyBackend::new(2));
    let conversation = flaky.inner.create_conversation(
        RequestId::generate(),
        AccountId::generate(),
        AccountId::generate(),
    );
    seed_history(&flaky.inner, &conversation, 4)?;

    let handle = DialogHandle::spawn(flaky.clone(), None, &runner_config());
    handle
        .select(conversation.request_id, Some(conversation.id))
        .context(DialogSnafu { stage: "select" })?;
    wait_for(&handle, "retry_budget", |state| {
        state.phase == LoadPhase::Ready && state.messages.len() == 4
    })
    .await?;
    let recovered_calls = flaky.fetch_calls.load(Ordering::SeqCst);
    ensure!(
        recovered_calls == 3,
        ScenarioFailedSnafu {
            stage: "retry-recover-check",
            scenario: "retry_budget",
            reason: format!("expected 3 fetch attempts, saw {recovered_calls}"),
        }
    );

    // Never recovers; the budget must stop at three attempts.
    let hopeless = Arc::new(FlakyBackend::new(u32::MAX));
    let doomed = hopeless.inner.create_conversation(
        RequestId::generate(),
        AccountId::generate(),
        AccountId::generate(),
    );
    let handle = DialogHandle::spawn(hopeless.clone(), None, &runner_config());
    handle
        .select(doomed.request_id, Some(doomed.id))
        .context(DialogSnafu { stage: "select" })?;
    let failed = wait_for(&handle, "retry_budget", |state| {
        state.phase == LoadPhase::Failed
    })
    .await?;
    let exhausted_calls = hopeless.fetch_calls.load(Ordering::SeqCst);
    ensure!(
        exhausted_calls == 3 && failed.last_error.is_some(),
        ScenarioFailedSnafu {
            stage: "retry-exhaust-check",
            scenario: "retry_budget",
            reason: format!("expected exactly 3 fetch attempts, saw {exhausted_calls}"),
        }
    );

    println!("recovered_after_attempts={recovered_calls}");
    println!("exhausted_attempts={exhausted_calls}");
    println!("runner_ok=true");
    Ok(())
}

async fn run_feed_accumulate() -> RunnerResult<()> {
    let backend = Arc::new(MemoryBackend::new());
    let conversation = backend.create_conversation(
        RequestId::generate(),
        AccountId::generate(),
        AccountId::generate(),
    );

    let handle = DialogHandle::spawn(backend.clone(), None, &runner_config());
    handle
        .select(conversation.request_id, Some(conversation.id))
        .context(DialogSnafu { stage: "select" })?;
    wait_for(&handle, "feed_accumulate", |state| {
        state.phase == LoadPhase::Ready
    })
    .await?;

    // More sends than the feed window covers; incremental merges must still
    // retain every message.
    for index in 0..15 {
        backend
            .send_message(conversation.id, NewMessage::text(format!("live {index}")))
            .await
            .context(StoreSnafu { stage: "send" })?;
    }

    let state = wait_for(&handle, "feed_accumulate", |state| {
        state.messages.len() == 15
    })
    .await?;
    ensure!(
        unique_ids(&state) && state.feed_notice.is_none(),
        ScenarioFailedSnafu {
            stage: "feed-accumulate-check",
            scenario: "feed_accumulate",
            reason: "feed merge dropped or duplicated messages".to_string(),
        }
    );

    println!("accumulated={}", state.messages.len());
    println!("runner_ok=true");
    Ok(())
}

async fn run_mutation_roundtrip() -> RunnerResult<()> {
    let backend = Arc::new(MemoryBackend::new());
    let conversation = backend.create_conversation(
        RequestId::generate(),
        AccountId::generate(),
        AccountId::generate(),
    );

    let handle = DialogHandle::spawn(backend.clone(), None, &runner_config());
    handle
        .select(conversation.request_id, Some(conversation.id))
        .context(DialogSnafu { stage: "select" })?;
    wait_for(&handle, "mutation_roundtrip", |state| {
        state.phase == LoadPhase::Ready
    })
    .await?;

    let sent = handle
        .send_message(NewMessage::text("draft one"))
        .await
        .context(DialogSnafu { stage: "send" })?;
    wait_for(&handle, "mutation_roundtrip", |state| {
        state.messages.iter().any(|message| message.id == sent.id)
    })
    .await?;

    let rejected = handle.send_message(NewMessage::text("   ")).await;
    ensure!(
        rejected.is_err(),
        ScenarioFailedSnafu {
            stage: "empty-body-check",
            scenario: "mutation_roundtrip",
            reason: "blank message body was accepted".to_string(),
        }
    );

    let edited = handle
        .edit_message(
            sent.id,
            MessagePatch {
                body: Some("draft two".to_string()),
            },
        )
        .await
        .context(DialogSnafu { stage: "edit" })?;
    ensure!(
        edited.edited && edited.body == "draft two",
        ScenarioFailedSnafu {
            stage: "edit-check",
            scenario: "mutation_roundtrip",
            reason: "edit did not round-trip".to_string(),
        }
    );
    wait_for(&handle, "mutation_roundtrip", |state| {
        state
            .messages
            .iter()
            .any(|message| message.id == sent.id && message.body == "draft two")
    })
    .await?;

    handle
        .delete_message(sent.id)
        .await
        .context(DialogSnafu { stage: "delete" })?;
    let state = wait_for(&handle, "mutation_roundtrip", |state| {
        state.messages.iter().all(|message| message.id != sent.id)
    })
    .await?;

    println!("remaining_after_delete={}", state.messages.len());
    println!("runner_ok=true");
    Ok(())
}

fn run_media_resolve() -> RunnerResult<()> {
    let locator = MediaLocator::new("https://cdn.example.com/media");
    let now = chrono::Utc::now();
    let image = MessageRecord {
        id: MessageId::generate(),
        conversation_id: ConversationId::generate(),
        body: "/rooms/xyz/photo.png".to_string(),
        kind: MessageKind::Image,
        sender_role: SenderRole::Tutor,
        sender_id: AccountId::generate(),
        created_at: now,
        updated_at: now,
        edited: false,
        seen: false,
    };

    let resolved = locator.resolve(&image);
    ensure!(
        resolved.as_deref() == Some("https://cdn.example.com/media/rooms/xyz/photo.png"),
        ScenarioFailedSnafu {
            stage: "media-resolve-check",
            scenario: "media_resolve",
            reason: format!("unexpected media url: {resolved:?}"),
        }
    );

    let mut text = image;
    text.kind = MessageKind::Text;
    ensure!(
        locator.resolve(&text).is_none(),
        ScenarioFailedSnafu {
            stage: "media-text-check",
            scenario: "media_resolve",
            reason: "text message resolved to a media url".to_string(),
        }
    );

    println!("media_resolve=true");
    println!("runner_ok=true");
    Ok(())
}

/// Delegating backend whose history fetch fails a configured number of times
/// before letting the in-memory store answer.
struct FlakyBackend {
    inner: MemoryBackend,
    failures_left: AtomicU32,
    fetch_calls: AtomicU32,
}

impl FlakyBackend {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryBackend::new(),
            failures_left: AtomicU32::new(failures),
            fetch_calls: AtomicU32::new(0),
        }
    }
}

impl MessageBackend for FlakyBackend {
    fn fetch_page(&self, request: PageRequest) -> BoxFuture<'_, StoreResult<MessagePage>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if failing {
            return Box::pin(async {
                Err(StoreError::Transport {
                    stage: "flaky-fetch-page",
                    details: "injected transport failure".to_string(),
                })
            });
        }
        self.inner.fetch_page(request)
    }

    fn open_feed(&self, conversation_id: ConversationId) -> StoreResult<FeedSubscription> {
        self.inner.open_feed(conversation_id)
    }

    fn send_message(
        &self,
        conversation_id: ConversationId,
        draft: NewMessage,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>> {
        self.inner.send_message(conversation_id, draft)
    }

    fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StoreResult<MessageRecord>> {
        self.inner.edit_message(conversation_id, message_id, patch)
    }

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StoreResult<()>> {
        self.inner.delete_message(conversation_id, message_id)
    }
}
