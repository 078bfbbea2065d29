//! Replay journal.
//!
//! Each invocation of a task (`InvocationKey`) owns an append-only list of
//! journal entries and a replay cursor (`ExecutionContext`). When an
//! invocation is re-entered after a crash or a suspension, the cursor starts
//! at zero again and every effect inside the recorded prefix returns its
//! stored output instead of running. The recorded op type and input hash must
//! match what the task asks for now; anything else is a divergence.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use nuoc_types::error::RepositoryError;
use nuoc_types::journal::{ExecutionContext, InvocationKey, JournalEntry, OpType};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::repository::DurableStore;

#[derive(Debug, Error)]
pub enum JournalError {
    /// Replayed code asked for something other than what was recorded.
    #[error("journal divergence at {key}#{index}: {reason}")]
    Divergence {
        key: String,
        index: u32,
        reason: String,
    },

    /// The effect body itself failed; nothing was recorded.
    #[error("effect failed: {0}")]
    EffectFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl JournalError {
    pub fn is_divergence(&self) -> bool {
        matches!(self, JournalError::Divergence { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JournalError::Repository(e) if e.is_retryable())
    }
}

/// Hex SHA-256 of the canonical JSON form of `input`.
pub fn hash_input(input: &Value) -> String {
    format!("{:x}", Sha256::digest(input.to_string().as_bytes()))
}

/// Journal operations over a `DurableStore`.
pub struct Journal<S: DurableStore> {
    store: Arc<S>,
}

impl<S: DurableStore> Clone for Journal<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: DurableStore> Journal<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Start (or restart) an invocation: cursor at 0, known count taken from
    /// the entries on record.
    pub async fn init_context(&self, key: &InvocationKey) -> Result<ExecutionContext, JournalError> {
        let known = self.store.count_journal_entries(key).await?;
        let ctx = ExecutionContext::new(key, known);
        self.store.save_context(&ctx).await?;
        tracing::debug!(invocation = %key, known, replay = ctx.replay_mode, "journal context initialised");
        Ok(ctx)
    }

    /// Hand out the next entry index and whether it lies in the recorded prefix.
    pub async fn next_entry_index(&self, key: &InvocationKey) -> Result<(u32, bool), JournalError> {
        let mut ctx = match self.store.get_context(key).await? {
            Some(ctx) => ctx,
            None => self.init_context(key).await?,
        };
        let next = ctx.advance();
        self.store.save_context(&ctx).await?;
        Ok(next)
    }

    /// Record one entry.
    pub async fn append(
        &self,
        key: &InvocationKey,
        entry_index: u32,
        op_type: OpType,
        input: &Value,
        output: &Value,
    ) -> Result<JournalEntry, JournalError> {
        let entry = JournalEntry {
            job_id: key.job_id.clone(),
            task_name: key.task_name.clone(),
            attempt: key.attempt,
            entry_index,
            op_type,
            input_hash: hash_input(input),
            input: input.clone(),
            output: output.clone(),
            created_at: Utc::now(),
        };
        self.store.append_journal(&entry).await?;
        Ok(entry)
    }

    /// Fetch a recorded entry and check that it matches the current request.
    async fn replayed(
        &self,
        key: &InvocationKey,
        index: u32,
        op_type: OpType,
        input: &Value,
    ) -> Result<JournalEntry, JournalError> {
        let divergence = |reason: String| JournalError::Divergence {
            key: key.to_string(),
            index,
            reason,
        };
        let entry = self
            .store
            .get_journal_entry(key, index)
            .await?
            .ok_or_else(|| divergence("entry missing from recorded prefix".to_string()))?;
        if entry.op_type != op_type {
            return Err(divergence(format!(
                "recorded {} but replay requested {op_type}",
                entry.op_type
            )));
        }
        if entry.input_hash != hash_input(input) {
            return Err(divergence(format!("input hash mismatch for {op_type}")));
        }
        Ok(entry)
    }

    /// Run a side effect at most once per invocation.
    ///
    /// Inside the recorded prefix the stored output is returned and `body` is
    /// not called. Otherwise `body` receives the entry index, and its output
    /// is recorded before being returned. A failing body records nothing.
    pub async fn effect<F, Fut>(
        &self,
        key: &InvocationKey,
        op_type: OpType,
        input: Value,
        body: F,
    ) -> Result<Value, JournalError>
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = Result<Value, JournalError>>,
    {
        let (index, replaying) = self.next_entry_index(key).await?;
        if replaying {
            let entry = self.replayed(key, index, op_type, &input).await?;
            tracing::trace!(invocation = %key, index, op = %op_type, "replayed journal entry");
            return Ok(entry.output);
        }

        let output = body(index).await?;
        self.append(key, index, op_type, &input, &output).await?;
        Ok(output)
    }

    pub async fn entries(&self, key: &InvocationKey) -> Result<Vec<JournalEntry>, JournalError> {
        Ok(self.store.list_journal(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn journal() -> (Arc<InMemoryStore>, Journal<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), Journal::new(store))
    }

    async fn counted_effect(
        journal: &Journal<InMemoryStore>,
        key: &InvocationKey,
        input: Value,
        calls: &AtomicU32,
    ) -> Result<Value, JournalError> {
        journal
            .effect(key, OpType::Run, input, |index| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({"index": index, "call": n}))
            })
            .await
    }

    #[test]
    fn test_hash_is_stable_and_key_order_independent() {
        let a = json!({"x": 1, "y": [1, 2]});
        let b: Value = serde_json::from_str(r#"{"y":[1,2],"x":1}"#).unwrap();
        assert_eq!(hash_input(&a), hash_input(&b));
        assert_eq!(hash_input(&a).len(), 64);
        assert_ne!(hash_input(&a), hash_input(&json!({"x": 2})));
    }

    #[tokio::test]
    async fn test_live_effects_run_and_record_in_order() {
        let (store, journal) = journal();
        let key = InvocationKey::new("j", "t", 1);
        let calls = AtomicU32::new(0);

        journal.init_context(&key).await.unwrap();
        counted_effect(&journal, &key, json!("first"), &calls).await.unwrap();
        counted_effect(&journal, &key, json!("second"), &calls).await.unwrap();

        let entries = store.list_journal(&key).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_index, 0);
        assert_eq!(entries[1].entry_index, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_replay_returns_recorded_outputs_without_running() {
        let (_store, journal) = journal();
        let key = InvocationKey::new("j", "t", 1);
        let calls = AtomicU32::new(0);

        journal.init_context(&key).await.unwrap();
        let first = counted_effect(&journal, &key, json!("a"), &calls).await.unwrap();
        let second = counted_effect(&journal, &key, json!("b"), &calls).await.unwrap();

        // Re-enter the same invocation, as after a crash.
        let ctx = journal.init_context(&key).await.unwrap();
        assert!(ctx.replay_mode);
        assert_eq!(ctx.known_entries, 2);

        assert_eq!(counted_effect(&journal, &key, json!("a"), &calls).await.unwrap(), first);
        assert_eq!(counted_effect(&journal, &key, json!("b"), &calls).await.unwrap(), second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Past the recorded prefix effects run live again.
        let third = counted_effect(&journal, &key, json!("c"), &calls).await.unwrap();
        assert_eq!(third["index"], 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_changed_input_is_a_divergence() {
        let (_store, journal) = journal();
        let key = InvocationKey::new("j", "t", 1);
        let calls = AtomicU32::new(0);

        journal.init_context(&key).await.unwrap();
        counted_effect(&journal, &key, json!({"cmd": "build"}), &calls).await.unwrap();

        journal.init_context(&key).await.unwrap();
        let err = counted_effect(&journal, &key, json!({"cmd": "deploy"}), &calls)
            .await
            .unwrap_err();
        assert!(err.is_divergence());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_changed_op_type_is_a_divergence() {
        let (_store, journal) = journal();
        let key = InvocationKey::new("j", "t", 1);

        journal.init_context(&key).await.unwrap();
        journal
            .effect(&key, OpType::Sleep, json!(null), |_| async { Ok(json!(null)) })
            .await
            .unwrap();

        journal.init_context(&key).await.unwrap();
        let err = journal
            .effect(&key, OpType::Run, json!(null), |_| async { Ok(json!(null)) })
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::Divergence { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_failed_body_records_nothing() {
        let (store, journal) = journal();
        let key = InvocationKey::new("j", "t", 1);

        journal.init_context(&key).await.unwrap();
        let err = journal
            .effect(&key, OpType::Run, json!(null), |_| async {
                Err(JournalError::EffectFailed("boom".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, JournalError::EffectFailed(_)));
        assert_eq!(store.count_journal_entries(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_append_conflicts() {
        let (_store, journal) = journal();
        let key = InvocationKey::new("j", "t", 1);
        journal
            .append(&key, 0, OpType::Input, &json!(1), &json!(2))
            .await
            .unwrap();
        let err = journal
            .append(&key, 0, OpType::Input, &json!(1), &json!(2))
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::Repository(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_invocations_are_isolated() {
        let (store, journal) = journal();
        let first = InvocationKey::new("j", "t", 1);
        let second = InvocationKey::new("j", "t", 2);
        let calls = AtomicU32::new(0);

        journal.init_context(&first).await.unwrap();
        counted_effect(&journal, &first, json!("x"), &calls).await.unwrap();

        let ctx = journal.init_context(&second).await.unwrap();
        assert!(!ctx.replay_mode);
        counted_effect(&journal, &second, json!("x"), &calls).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.count_journal_entries(&first).await.unwrap(), 1);
        assert_eq!(store.count_journal_entries(&second).await.unwrap(), 1);
    }
}
