use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing;
use uuid::Uuid;

use crate::server::ApiState;

const JOBS_PREFIX: &str = "/api/v1/jobs/";

/// Claims of a trainer session token issued by the auth provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub trainer_id: Uuid,
    pub exp: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedTrainer {
    pub trainer_id: Uuid,
}

fn extract_token(auth_header: Option<&str>) -> Option<&str> {
    auth_header?.strip_prefix("Bearer ").map(str::trim)
}

/// Compares without short-circuiting on the first differing byte.
fn secrets_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

/// Issues a trainer token. Production tokens come from the auth provider;
/// this exists for local runs and tests.
pub fn generate_token(trainer_id: Uuid, secret: &str, expires_in_secs: u64) -> Result<String, StatusCode> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .as_secs();

    let claims = Claims {
        trainer_id,
        exp: (now + expires_in_secs) as usize,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref())).map_err(|e| {
        tracing::error!("Failed to generate JWT token: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

pub fn verify_token(token: &str, secret: &str) -> Result<Uuid, StatusCode> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());

    match decode::<Claims>(token, &decoding_key, &Validation::default()) {
        Ok(token_data) => Ok(token_data.claims.trainer_id),
        Err(e) => {
            tracing::debug!("JWT verification failed: {}", e);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Job routes take the shared job secret; every other route except
/// `/health` takes a trainer JWT.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path().to_string();
    if path == "/health" {
        return Ok(next.run(req).await);
    }

    let token = extract_token(req.headers().get(AUTHORIZATION).and_then(|h| h.to_str().ok()))
        .map(str::to_string)
        .ok_or_else(|| {
            tracing::debug!("Missing Authorization header");
            StatusCode::UNAUTHORIZED
        })?;

    let state = req
        .extensions()
        .get::<ApiState>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    if path.starts_with(JOBS_PREFIX) {
        if !secrets_match(&token, &state.ctx.config.server.job_secret) {
            tracing::warn!("Rejected job trigger on {} with a bad secret", path);
            return Err(StatusCode::UNAUTHORIZED);
        }
        return Ok(next.run(req).await);
    }

    let trainer_id = verify_token(&token, &state.ctx.config.server.jwt_secret)?;
    req.extensions_mut().insert(AuthenticatedTrainer { trainer_id });
    tracing::debug!("Authenticated trainer: {}", trainer_id);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_trainer_id() {
        let trainer = Uuid::new_v4();
        let token = generate_token(trainer, "secret", 60).unwrap();

        assert_eq!(verify_token(&token, "secret").unwrap(), trainer);
        assert_eq!(verify_token(&token, "other"), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn job_secret_must_match_exactly() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3creT"));
        assert!(!secrets_match("s3cre", "s3cret"));
        assert!(!secrets_match("", "s3cret"));
    }

    #[test]
    fn bearer_prefix_is_required() {
        assert_eq!(extract_token(Some("Bearer abc ")), Some("abc"));
        assert_eq!(extract_token(Some("Basic abc")), None);
        assert_eq!(extract_token(None), None);
    }
}
