use crate::orchestrator::BatchProgress;
use crate::service::{
    CancelRun, GetRunStatus, PublishService, PushSku, PushSlice, StartFullRun, SyncMappings,
};
use actix::prelude::*;
use actix_web::{
    get, post,
    web::{Data, Json, Path, ServiceConfig},
    HttpResponse,
};
use anyhow::Context;
use derive_more::{Display, Error};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub type Response = Result<HttpResponse, ControllerError>;
type Service = Data<Arc<Addr<PublishService>>>;

#[derive(Debug, Display, Error)]
pub enum ControllerError {
    #[error(ignore)]
    Conflict(String),
    #[error(ignore)]
    InternalServerError(anyhow::Error),
    #[error(ignore)]
    #[display("Invalid field {field}")]
    InvalidInput {
        field: String,
        msg: String,
    },
}

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalServerError(err)
    }
}

impl From<actix::MailboxError> for ControllerError {
    fn from(err: actix::MailboxError) -> Self {
        Self::InternalServerError(err.into())
    }
}

impl actix_web::error::ResponseError for ControllerError {
    fn error_response(&self) -> HttpResponse {
        log::warn!("{self:?}\n");
        use ControllerError::*;
        match self {
            Conflict(msg) => HttpResponse::Conflict().json(json!({"error": msg})),
            InternalServerError(err) => {
                HttpResponse::InternalServerError().json(json!({"error": format!("{err:#}")}))
            }
            InvalidInput { field, msg } => {
                HttpResponse::BadRequest().json(json!({"error": msg, "field": field}))
            }
        }
    }
}

fn invalid(field: &str, msg: &str) -> ControllerError {
    ControllerError::InvalidInput {
        field: field.to_string(),
        msg: msg.to_string(),
    }
}

#[derive(Deserialize, Default)]
pub struct PushSkuInput {
    #[serde(default)]
    pub manual: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct PushSliceInput {
    pub skus: Vec<String>,
    #[serde(default)]
    pub start: usize,
    pub len: Option<usize>,
    pub progress: Option<BatchProgress>,
    #[serde(default)]
    pub manual: Option<Vec<String>>,
}

#[post("/fbt/push/{sku}")]
async fn push_sku(
    service: Service,
    sku: Path<String>,
    input: Option<Json<PushSkuInput>>,
) -> Response {
    let sku = sku.into_inner();
    if sku.trim().is_empty() {
        return Err(invalid("sku", "SKU is empty"));
    }
    let input = input.map(Json::into_inner).unwrap_or_default();
    let outcome = service
        .send(PushSku {
            sku,
            manual: input.manual,
        })
        .await?
        .context("Unable to push sku")?;
    match outcome {
        Some(outcome) => Ok(HttpResponse::Ok().json(outcome)),
        None => Err(ControllerError::Conflict("push cancelled".to_string())),
    }
}

#[post("/fbt/push-slice")]
async fn push_slice(service: Service, input: Json<PushSliceInput>) -> Response {
    let input = input.into_inner();
    if input.skus.is_empty() {
        return Err(invalid("skus", "SKU list is empty"));
    }
    if input.start > input.skus.len() {
        return Err(invalid("start", "start is past the end of the list"));
    }
    if let Some(progress) = &input.progress {
        if !progress.is_consistent() || progress.total != input.skus.len() {
            return Err(invalid("progress", "progress does not match the SKU list"));
        }
    }
    let res = service
        .send(PushSlice {
            skus: input.skus,
            start: input.start,
            len: input.len,
            progress: input.progress,
            manual: input.manual,
        })
        .await?
        .context("Unable to push slice")?;
    Ok(HttpResponse::Ok().json(res))
}

#[post("/fbt/run")]
async fn start_run(service: Service) -> Response {
    match service.send(StartFullRun).await? {
        Ok(run_id) => Ok(HttpResponse::Accepted().json(json!({ "run_id": run_id }))),
        Err(err) => Err(ControllerError::Conflict(err.to_string())),
    }
}

#[post("/fbt/cancel")]
async fn cancel_run(service: Service) -> Response {
    let cancelled = service.send(CancelRun).await?;
    Ok(HttpResponse::Ok().json(json!({ "cancelled": cancelled })))
}

#[get("/fbt/status")]
async fn run_status(service: Service) -> Response {
    let state = service.send(GetRunStatus).await?;
    Ok(HttpResponse::Ok().json(state))
}

#[post("/fbt/sync-mappings")]
async fn sync_mappings(service: Service) -> Response {
    let written = service
        .send(SyncMappings)
        .await?
        .context("Unable to sync mappings")?;
    Ok(HttpResponse::Ok().json(json!({ "written": written })))
}

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(push_sku)
        .service(push_slice)
        .service(start_run)
        .service(cancel_run)
        .service(run_status)
        .service(sync_mappings);
}
