//! `nuoc resolve` / `nuoc reject`: complete an awakeable directly in the
//! journal database. A running server's driver wakes the task on its next tick.

use anyhow::Context;
use nuoc_types::awakeable::AwakeableId;
use serde_json::{Value, json};

use crate::state::AppState;

pub async fn resolve(state: &AppState, id: &str, payload: Option<&str>, json_out: bool) -> anyhow::Result<()> {
    let id: AwakeableId = id.parse().context("invalid awakeable id")?;
    let payload: Value = match payload {
        Some(raw) => serde_json::from_str(raw).context("payload is not valid JSON")?,
        None => json!({}),
    };

    let awakeable = state.scheduler.awakeables().resolve(&id, payload).await?;
    if json_out {
        println!("{}", serde_json::to_string_pretty(&awakeable)?);
    } else {
        println!(
            "Resolved {id} (job '{}', task '{}')",
            awakeable.job_id, awakeable.task_name
        );
    }
    Ok(())
}

pub async fn reject(state: &AppState, id: &str, reason: &str, json_out: bool) -> anyhow::Result<()> {
    let id: AwakeableId = id.parse().context("invalid awakeable id")?;
    let awakeable = state.scheduler.awakeables().reject(&id, reason).await?;
    if json_out {
        println!("{}", serde_json::to_string_pretty(&awakeable)?);
    } else {
        println!(
            "Rejected {id} (job '{}', task '{}'): {reason}",
            awakeable.job_id, awakeable.task_name
        );
    }
    Ok(())
}
