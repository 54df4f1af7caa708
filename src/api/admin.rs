//! Operator routes: block list management, flag listing and manual job runs.

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::api::{AppState, ErrorResponse};
use crate::core::block_list::BlockOutcome;
use crate::core::identity::parse_identity;
use crate::core::scheduler::Task;

pub(crate) const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/blocks")
            .route(web::get().to(list_blocks))
            .route(web::post().to(create_block)),
    )
    .service(web::resource("/blocks/{ip}").route(web::delete().to(delete_block)))
    .service(web::resource("/flags").route(web::get().to(list_flags)))
    .service(web::resource("/tasks/{task}").route(web::post().to(run_task)));
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRequest {
    pub ip: String,
    #[serde(default)]
    pub reason: String,
    /// Overwrite the reason of an existing block
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct FlagQuery {
    #[serde(default)]
    pub active: Option<bool>,
}

pub(crate) fn authorize(req: &HttpRequest, state: &AppState) -> Result<(), HttpResponse> {
    let Some(expected) = state.admin.token.as_deref() else {
        return Ok(());
    };
    let supplied = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if supplied == Some(expected) {
        Ok(())
    } else {
        warn!("Rejected operator request to {}", req.path());
        Err(HttpResponse::Unauthorized().json(ErrorResponse::new("invalid admin token")))
    }
}

fn unavailable(e: impl std::fmt::Display) -> HttpResponse {
    error!("Operator request failed: {}", e);
    HttpResponse::ServiceUnavailable().json(ErrorResponse::new(e.to_string()))
}

async fn list_blocks(req: HttpRequest, state: web::Data<AppState>) -> impl Responder {
    if let Err(resp) = authorize(&req, &state) {
        return resp;
    }
    match state.gate.list().await {
        Ok(mut blocks) => {
            blocks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            HttpResponse::Ok().json(blocks)
        }
        Err(e) => unavailable(e),
    }
}

async fn create_block(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<BlockRequest>,
) -> impl Responder {
    if let Err(resp) = authorize(&req, &state) {
        return resp;
    }
    let ip = match parse_identity(&body.ip) {
        Ok(ip) => ip,
        Err(e) => return HttpResponse::BadRequest().json(ErrorResponse::new(e.to_string())),
    };

    match state.gate.block(&ip.to_string(), &body.reason, body.force).await {
        Ok(outcome @ BlockOutcome::Created { .. }) => HttpResponse::Created().json(outcome),
        Ok(outcome @ BlockOutcome::Updated { .. }) => HttpResponse::Ok().json(outcome),
        Ok(outcome @ BlockOutcome::AlreadyBlocked { .. }) => HttpResponse::Conflict().json(outcome),
        Err(e) => unavailable(e),
    }
}

async fn delete_block(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    if let Err(resp) = authorize(&req, &state) {
        return resp;
    }
    let ip = match parse_identity(&path) {
        Ok(ip) => ip,
        Err(e) => return HttpResponse::BadRequest().json(ErrorResponse::new(e.to_string())),
    };

    match state.gate.unblock(&ip.to_string()).await {
        Ok(true) => HttpResponse::NoContent().finish(),
        Ok(false) => HttpResponse::NotFound().json(ErrorResponse::new(format!(
            "IP address {} is not currently blocked",
            ip
        ))),
        Err(e) => unavailable(e),
    }
}

async fn list_flags(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<FlagQuery>,
) -> impl Responder {
    if let Err(resp) = authorize(&req, &state) {
        return resp;
    }
    match state.flags.list().await {
        Ok(flags) => {
            let mut flags: Vec<_> = flags
                .into_iter()
                .filter(|flag| query.active.map_or(true, |active| flag.is_active == active))
                .collect();
            flags.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
            HttpResponse::Ok().json(flags)
        }
        Err(e) => unavailable(e),
    }
}

async fn run_task(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    if let Err(resp) = authorize(&req, &state) {
        return resp;
    }
    let task: Task = match path.parse() {
        Ok(task) => task,
        Err(e) => return HttpResponse::NotFound().json(ErrorResponse::new(e)),
    };

    match state.jobs.run(task).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => {
            error!("Task {:?} failed: {}", task, e);
            HttpResponse::InternalServerError().json(ErrorResponse::new(e.to_string()))
        }
    }
}
