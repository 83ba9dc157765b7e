use axum::extract::State;
use axum::Json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::storage::SettingKey;

/// Every enumerated key, defaults applied, credentials decrypted.
pub async fn get_all(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<BTreeMap<String, String>>> {
    Ok(Json(state.db.get_all_settings().await?))
}

/// Upsert any subset of keys. Unknown keys are rejected outright so typos
/// never silently create dead settings; encrypted keys are sealed by the
/// store on the way in.
pub async fn update(
    State(state): State<Arc<AppState>>,
    Json(updates): Json<BTreeMap<String, String>>,
) -> AppResult<Json<serde_json::Value>> {
    // Validate the whole batch before writing any of it
    let mut resolved = Vec::with_capacity(updates.len());
    for (key, value) in &updates {
        let key = SettingKey::from_str(key)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown setting: {key}")))?;
        resolved.push((key, value.as_str()));
    }

    for (key, value) in resolved {
        state.db.set_setting(key, value).await?;
    }

    Ok(Json(serde_json::json!({ "updated": updates.len() })))
}
