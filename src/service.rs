use crate::config::load_overrides;
use crate::mapping_sync::sync_mappings;
use crate::orchestrator::{BatchProgress, Orchestrator, SkuOutcome, SliceCursor};
use actix::prelude::*;
use anyhow::{anyhow, Context as AnyhowContext};
use catalog_client::CatalogClient;
use fbt_types::overrides::ManualOverrideSet;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const RECENT_LOG_LINES: usize = 50;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    InProgress,
    Success,
    Cancelled,
    Failure(String),
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::InProgress => write!(f, "In progress"),
            Self::Success => write!(f, "Success"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failure(err) => write!(f, "Failure: {err}"),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ProgressInfo {
    pub total: usize,
    pub processed: usize,
    pub successes: usize,
    pub failures: usize,
    pub skipped: usize,
    pub recent_log: Vec<String>,
}

impl From<&BatchProgress> for ProgressInfo {
    fn from(p: &BatchProgress) -> Self {
        let skip = p.log.len().saturating_sub(RECENT_LOG_LINES);
        Self {
            total: p.total,
            processed: p.processed,
            successes: p.successes.len(),
            failures: p.failures.len(),
            skipped: p.skipped.len(),
            recent_log: p.log.iter().skip(skip).cloned().collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunState {
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    pub progress: Option<ProgressInfo>,
    /// Full record of the last finished run.
    pub last_result: Option<BatchProgress>,
    pub last_started: Option<OffsetDateTime>,
    pub last_finished: Option<OffsetDateTime>,
    pub catalog_ceiling: usize,
    pub catalog_in_flight: usize,
    /// Set only while a full run is in progress.
    #[serde(skip)]
    run_token: Option<CancellationToken>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            run_id: None,
            status: RunStatus::Idle,
            progress: None,
            last_result: None,
            last_started: None,
            last_finished: None,
            catalog_ceiling: 0,
            catalog_in_flight: 0,
            run_token: None,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct SliceResponse {
    pub progress: BatchProgress,
    pub cursor: SliceCursor,
}

#[derive(Message)]
#[rtype(result = "Result<Option<SkuOutcome>, anyhow::Error>")]
pub struct PushSku {
    pub sku: String,
    pub manual: Option<Vec<String>>,
}

#[derive(Message)]
#[rtype(result = "Result<SliceResponse, anyhow::Error>")]
pub struct PushSlice {
    pub skus: Vec<String>,
    pub start: usize,
    pub len: Option<usize>,
    pub progress: Option<BatchProgress>,
    pub manual: Option<Vec<String>>,
}

#[derive(Message)]
#[rtype(result = "Result<Uuid, anyhow::Error>")]
pub struct StartFullRun;

#[derive(Message)]
#[rtype(result = "bool")]
pub struct CancelRun;

#[derive(Message)]
#[rtype(result = "RunState")]
pub struct GetRunStatus;

#[derive(Message)]
#[rtype(result = "Result<usize, anyhow::Error>")]
pub struct SyncMappings;

pub struct PublishService {
    orchestrator: Arc<Orchestrator>,
    client: CatalogClient,
    overrides_path: PathBuf,
    sync_page_size: usize,
    state: Arc<RwLock<RunState>>,
    token: CancellationToken,
    pb_style: Option<ProgressStyle>,
}

impl PublishService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        client: CatalogClient,
        overrides_path: PathBuf,
        sync_page_size: usize,
        token: CancellationToken,
        pb_style: Option<ProgressStyle>,
    ) -> Self {
        Self {
            orchestrator,
            client,
            overrides_path,
            sync_page_size,
            state: Arc::new(RwLock::new(RunState::default())),
            token,
            pb_style,
        }
    }

    fn overrides(
        &self,
        manual: Option<Vec<String>>,
    ) -> impl std::future::Future<Output = anyhow::Result<ManualOverrideSet>> {
        let path = self.overrides_path.clone();
        async move {
            match manual {
                Some(manual) if !manual.is_empty() => {
                    ManualOverrideSet::for_any_hub(manual).context("Invalid manual list")
                }
                _ => load_overrides(path).await,
            }
        }
    }
}

impl Actor for PublishService {
    type Context = Context<Self>;
}

impl Handler<PushSku> for PublishService {
    type Result = ResponseActFuture<Self, Result<Option<SkuOutcome>, anyhow::Error>>;

    fn handle(&mut self, PushSku { sku, manual }: PushSku, _: &mut Self::Context) -> Self::Result {
        let orchestrator = self.orchestrator.clone();
        let overrides = self.overrides(manual);
        let token = self.token.clone();
        let fut = async move {
            let overrides = overrides.await?;
            let outcome = orchestrator.push_one(&sku, &overrides, &token).await?;
            if let Some(outcome) = &outcome {
                log::info!("{}", outcome.log_line());
            }
            Ok(outcome)
        };
        Box::pin(fut.into_actor(self))
    }
}

impl Handler<PushSlice> for PublishService {
    type Result = ResponseActFuture<Self, Result<SliceResponse, anyhow::Error>>;

    fn handle(
        &mut self,
        PushSlice {
            skus,
            start,
            len,
            progress,
            manual,
        }: PushSlice,
        _: &mut Self::Context,
    ) -> Self::Result {
        let orchestrator = self.orchestrator.clone();
        let overrides = self.overrides(manual);
        let token = self.token.clone();
        let fut = async move {
            let overrides = overrides.await?;
            let len = len.unwrap_or(orchestrator.options().chunk_size);
            let mut progress = progress.unwrap_or_else(|| BatchProgress::new(skus.len()));
            let cursor = orchestrator
                .push_slice(&mut progress, &skus, start, len, None, &overrides, &token)
                .await?;
            Ok(SliceResponse { progress, cursor })
        };
        Box::pin(fut.into_actor(self))
    }
}

impl Handler<StartFullRun> for PublishService {
    type Result = ResponseActFuture<Self, Result<Uuid, anyhow::Error>>;

    fn handle(&mut self, _: StartFullRun, _: &mut Self::Context) -> Self::Result {
        let state = self.state.clone();
        let orchestrator = self.orchestrator.clone();
        let overrides = self.overrides(None);
        let token = self.token.child_token();
        let pb_style = self.pb_style.clone();
        let fut = async move {
            let run_id = Uuid::new_v4();
            {
                let mut state = state.write().await;
                if state.status == RunStatus::InProgress {
                    return Err(anyhow!("Run already in progress"));
                }
                state.run_id = Some(run_id);
                state.status = RunStatus::InProgress;
                state.progress = None;
                state.last_started = Some(OffsetDateTime::now_utc());
                state.last_finished = None;
                state.run_token = Some(token.clone());
            }
            actix::spawn(async move {
                let res = match overrides.await {
                    Ok(overrides) => {
                        full_run(&orchestrator, &overrides, &state, &token, pb_style).await
                    }
                    Err(err) => Err(err),
                };
                let mut state = state.write().await;
                state.run_token = None;
                state.last_finished = Some(OffsetDateTime::now_utc());
                match res {
                    Ok(progress) => {
                        state.status = if progress.cancelled {
                            RunStatus::Cancelled
                        } else {
                            RunStatus::Success
                        };
                        log::info!(
                            "FBT run {run_id} finished: {}, {}/{} processed",
                            state.status,
                            progress.processed,
                            progress.total
                        );
                        state.progress = Some(ProgressInfo::from(&progress));
                        state.last_result = Some(progress);
                    }
                    Err(err) => {
                        log::error!("FBT run {run_id} failed: {err:?}");
                        state.status = RunStatus::Failure(format!("{err:#}"));
                    }
                }
            });
            Ok(run_id)
        };
        Box::pin(fut.into_actor(self))
    }
}

impl Handler<CancelRun> for PublishService {
    type Result = ResponseActFuture<Self, bool>;

    fn handle(&mut self, _: CancelRun, _: &mut Self::Context) -> Self::Result {
        let state = self.state.clone();
        let fut = async move {
            match state.write().await.run_token.take() {
                Some(token) if !token.is_cancelled() => {
                    log::info!("Cancelling FBT run");
                    token.cancel();
                    true
                }
                _ => false,
            }
        };
        Box::pin(fut.into_actor(self))
    }
}

impl Handler<GetRunStatus> for PublishService {
    type Result = ResponseActFuture<Self, RunState>;

    fn handle(&mut self, _: GetRunStatus, _: &mut Self::Context) -> Self::Result {
        let state = self.state.clone();
        let limiter = self.client.limiter();
        let (ceiling, in_flight) = (limiter.ceiling(), limiter.in_flight());
        let fut = async move {
            let mut state = state.read().await.clone();
            state.catalog_ceiling = ceiling;
            state.catalog_in_flight = in_flight;
            state
        };
        Box::pin(fut.into_actor(self))
    }
}

impl Handler<SyncMappings> for PublishService {
    type Result = ResponseActFuture<Self, Result<usize, anyhow::Error>>;

    fn handle(&mut self, _: SyncMappings, _: &mut Self::Context) -> Self::Result {
        let client = self.client.clone();
        let orchestrator = self.orchestrator.clone();
        let page_size = self.sync_page_size;
        let token = self.token.clone();
        let fut = async move {
            sync_mappings(&client, orchestrator.mappings().as_ref(), page_size, &token).await
        };
        Box::pin(fut.into_actor(self))
    }
}

/// Pushes every known SKU, one chunk per slice, publishing a summary after
/// each slice.
async fn full_run(
    orchestrator: &Orchestrator,
    overrides: &ManualOverrideSet,
    state: &RwLock<RunState>,
    token: &CancellationToken,
    pb_style: Option<ProgressStyle>,
) -> anyhow::Result<BatchProgress> {
    let mappings = orchestrator.mappings();
    let skus = mappings.list_skus().await.context("Unable to list skus")?;
    let cache = mappings
        .get_many(&skus)
        .await
        .context("Unable to prefetch sku mappings")?;
    log::info!("FBT run over {} skus", skus.len());

    let pb = pb_style.map(|style| ProgressBar::new(skus.len() as u64).with_style(style));
    let chunk_size = orchestrator.options().chunk_size.max(1);
    let mut progress = BatchProgress::new(skus.len());
    let mut next_index = 0;
    loop {
        if token.is_cancelled() {
            progress.cancelled = true;
            break;
        }
        let res = orchestrator
            .push_slice(
                &mut progress,
                &skus,
                next_index,
                chunk_size,
                Some(&cache),
                overrides,
                token,
            )
            .await;
        state.write().await.progress = Some(ProgressInfo::from(&progress));
        if let Some(pb) = &pb {
            pb.set_position(progress.processed as u64);
        }
        let SliceCursor { next_index: next, done } = res?;
        next_index = next;
        if done || progress.cancelled {
            break;
        }
    }
    if let Some(pb) = pb {
        pb.finish_with_message(format!(
            "{} pushed, {} failed, {} skipped",
            progress.successes.len(),
            progress.failures.len(),
            progress.skipped.len()
        ));
    }
    Ok(progress)
}
