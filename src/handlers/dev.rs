use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::queries;
use crate::errors::AppError;
use crate::models::User;
use crate::state::AppState;

const SESSION_DAYS: i64 = 7;

// POST /api/dev/session
#[derive(Deserialize)]
pub struct DevLogin {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevSession {
    pub token: String,
    pub user_id: String,
    pub expires_at: String,
}

/// Signs in by email for local testing, creating the user on first use.
/// Only served when `DEV_LOGIN=true`.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DevLogin>,
) -> Result<Json<DevSession>, AppError> {
    if !state.config.dev_login {
        return Err(AppError::NotFound("dev login is disabled".to_string()));
    }

    let email = req.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(AppError::BadRequest("email is invalid".to_string()));
    }

    let token = uuid::Uuid::new_v4().simple().to_string();
    let expires_at = Utc::now().naive_utc() + Duration::days(SESSION_DAYS);

    let user = {
        let db = state
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        let user = match queries::get_user_by_email(&db, &email)? {
            Some(user) => user,
            None => {
                let user = User {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: req
                        .name
                        .map(|n| n.trim().to_string())
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| email.clone()),
                    email: email.clone(),
                };
                queries::create_user(&db, &user)?;
                user
            }
        };
        queries::create_session(&db, &token, &user.id, &expires_at)?;
        user
    };

    tracing::info!(user_id = %user.id, "dev session created");

    Ok(Json(DevSession {
        token,
        user_id: user.id,
        expires_at: expires_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    }))
}
