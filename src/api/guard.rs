//! Request gate middleware.
//!
//! Runs on every request: rate limiting (skipped for exempt paths), then the
//! block list, then the handler, then the request log.

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header;
use actix_web::middleware::Next;
use actix_web::{web, Error, HttpResponse};
use log::{debug, error, info};
use std::net::IpAddr;

use crate::api::{AppState, ErrorResponse};
use crate::core::identity::{client_ip, RateLimitKey};
use crate::core::store::RequestLogEntry;
use crate::models::WindowPolicy;

pub async fn request_guard(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<BoxBody>, Error> {
    let Some(state) = req.app_data::<web::Data<AppState>>().cloned() else {
        return Ok(next.call(req).await?.map_into_boxed_body());
    };

    let path = req.path().to_string();
    let exempt = state.rate_limiter.is_exempt(&path);

    let forwarded_for = req
        .headers()
        .get(header::X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok());
    let peer = req.peer_addr().map(|addr| addr.ip());
    let ip = match client_ip(forwarded_for, peer, state.identity.trust_forwarded_for) {
        Ok(ip) => ip,
        Err(e) if exempt => {
            debug!("Passing exempt path {} without identity: {}", path, e);
            return Ok(next.call(req).await?.map_into_boxed_body());
        }
        Err(e) => {
            return Ok(req.into_response(HttpResponse::BadRequest().json(ErrorResponse::new(e.to_string()))));
        }
    };

    if !exempt {
        let key = rate_limit_key(&req, &state, ip);
        if let Some(policy) = state.rate_limiter.policy_for(key.scope) {
            if !state.rate_limiter.allow_with(&key, policy).await.is_allowed() {
                return Ok(req.into_response(too_many_requests(policy)));
            }
        }
    }

    let identity = ip.to_string();
    if !state.gate.check(&identity).await.is_allowed() {
        return Ok(req.into_response(
            HttpResponse::Forbidden().json(ErrorResponse::new("Your IP address is blocked")),
        ));
    }

    info!("Request from IP: {}, Path: {}", identity, path);
    let res = next.call(req).await?;

    let entry = RequestLogEntry::new(identity, path, state.clock.now());
    if let Err(e) = state.request_log.append(entry).await {
        error!("Failed to save request log: {}", e);
    }

    Ok(res.map_into_boxed_body())
}

/// Callers are anonymous unless a user header is configured.
fn rate_limit_key(req: &ServiceRequest, state: &AppState, ip: IpAddr) -> RateLimitKey {
    let Some(user_header) = state.identity.user_header.as_deref() else {
        return RateLimitKey::anonymous(ip);
    };
    let user = req
        .headers()
        .get(user_header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty());

    match user {
        Some(user_id) => RateLimitKey::authenticated(user_id, ip),
        None => RateLimitKey::anonymous(ip),
    }
}

/// Rejection sent when a caller's window is full.
pub fn too_many_requests(policy: WindowPolicy) -> HttpResponse {
    HttpResponse::TooManyRequests()
        .insert_header((header::RETRY_AFTER, policy.window_seconds.to_string()))
        .json(ErrorResponse::new(rate_limit_message(policy)))
}

pub fn rate_limit_message(policy: WindowPolicy) -> String {
    if policy.window_seconds == 60 {
        format!(
            "Rate limit exceeded. Maximum {} requests per minute allowed.",
            policy.limit
        )
    } else {
        format!(
            "Rate limit exceeded. Maximum {} requests per {} seconds allowed.",
            policy.limit, policy.window_seconds
        )
    }
}
