use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use bazaar_core::{Actor, EventRole, ViewerContext};
use bazaar_shared::{EventId, MerchItemId, VendorId};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Sells tickets or merch; `sub` is the vendor id.
    Vendor,
    /// Back-office staff.
    Operator,
    /// Service-to-service calls such as the payment collaborator.
    System,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EventRoleClaim {
    pub event_id: EventId,
    pub role: EventRole,
}

/// Asserted by the auth collaborator. Roles and brand ownership are taken as
/// given; nothing here is looked up.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize,
    #[serde(default)]
    pub event_roles: Vec<EventRoleClaim>,
    #[serde(default)]
    pub brand_items: Vec<MerchItemId>,
}

impl Claims {
    pub fn new(sub: impl Into<String>, role: Role, ttl_seconds: u64) -> Self {
        // Capped at ten years.
        let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX).min(315_360_000);
        let exp = Utc::now() + Duration::seconds(ttl);
        Self {
            sub: sub.into(),
            role,
            exp: usize::try_from(exp.timestamp()).unwrap_or(0),
            event_roles: Vec::new(),
            brand_items: Vec::new(),
        }
    }

    pub fn with_event_role(mut self, event_id: impl Into<String>, role: EventRole) -> Self {
        self.event_roles.push(EventRoleClaim {
            event_id: EventId::new(event_id),
            role,
        });
        self
    }

    pub fn with_brand_item(mut self, item: impl Into<String>) -> Self {
        self.brand_items.push(MerchItemId::new(item));
        self
    }

    pub fn vendor_id(&self) -> VendorId {
        VendorId::new(self.sub.clone())
    }

    pub fn viewer(&self) -> ViewerContext {
        let mut viewer = ViewerContext::new(self.vendor_id());
        for claim in &self.event_roles {
            viewer = viewer.with_event_role(claim.event_id.clone(), claim.role);
        }
        for item in &self.brand_items {
            viewer = viewer.with_brand_item(item.clone());
        }
        viewer
    }

    pub fn actor(&self) -> Actor {
        match self.role {
            Role::Vendor => Actor::Vendor(self.vendor_id()),
            Role::Operator => Actor::User(self.sub.clone()),
            Role::System => Actor::System,
        }
    }

    pub fn require(&self, allowed: &[Role]) -> Result<(), AppError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!("role {:?} may not call this endpoint", self.role)))
        }
    }
}

pub fn issue_token(claims: &Claims, secret: &str) -> Result<String, AppError> {
    encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AppError::Unauthorized(format!("Token encoding failed: {}", e)))
}

// ============================================================================
// Authentication Middleware
// ============================================================================

pub async fn auth_middleware(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    // 1. Extract token
    let TypedHeader(Authorization(bearer)) =
        bearer.ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;

    // 2. Decode and validate JWT (HS256, exp)
    let token_data = decode::<Claims>(
        bearer.token(),
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthorized("invalid or expired token".into()))?;

    // 3. Inject claims
    req.extensions_mut().insert(token_data.claims);

    Ok(next.run(req).await)
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Per-IP fixed window in Redis. Passes everything through when Redis is not
/// configured or not reachable.
pub async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(redis) = state.redis.as_ref() else {
        return next.run(req).await;
    };

    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".into());
    let key = format!("ratelimit:{}", ip);

    match redis
        .check_rate_limit(&key, state.rate_limit.requests, state.rate_limit.window_seconds)
        .await
    {
        Ok(true) => next.run(req).await,
        Ok(false) => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "rate limiter unavailable");
            next.run(req).await // Fail open
        }
    }
}
