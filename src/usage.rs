//! Append-only usage ledger (§4.I): one NDJSON line per provider call,
//! shared by the ingestion pipeline's finalize step and the flow engine's
//! completion/guardrails nodes.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Completion,
    Embedding,
    Enrichment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub kind: UsageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Marks usage from an intermediate, tool-producing completion
    /// iteration rather than a run's final content (§4.J Completion node).
    #[serde(default)]
    pub internal: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub calls: u64,
}

impl UsageTotals {
    fn accumulate(&mut self, entry: &UsageEntry) {
        self.prompt_tokens += entry.prompt_tokens.unwrap_or(0);
        self.completion_tokens += entry.completion_tokens.unwrap_or(0);
        self.total_tokens += entry.total_tokens.unwrap_or(0);
        self.cost_usd += entry.cost_usd.unwrap_or(0.0);
        self.calls += 1;
    }
}

pub struct UsageLedger {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl UsageLedger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            append_lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, entry: UsageEntry) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<UsageEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<UsageEntry>(line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn totals_by_model(&self) -> Result<HashMap<String, UsageTotals>> {
        let entries = self.read_all().await?;
        let mut totals: HashMap<String, UsageTotals> = HashMap::new();
        for entry in &entries {
            totals.entry(entry.model.clone()).or_default().accumulate(entry);
        }
        Ok(totals)
    }

    pub async fn totals_by_doc(&self) -> Result<HashMap<String, UsageTotals>> {
        let entries = self.read_all().await?;
        let mut totals: HashMap<String, UsageTotals> = HashMap::new();
        for entry in &entries {
            if let Some(doc_id) = &entry.doc_id {
                totals.entry(doc_id.clone()).or_default().accumulate(entry);
            }
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(model: &str, doc_id: Option<&str>, total_tokens: u64) -> UsageEntry {
        UsageEntry {
            timestamp: Utc::now(),
            model: model.to_string(),
            kind: UsageKind::Embedding,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: Some(total_tokens),
            cost_usd: Some(0.01),
            doc_id: doc_id.map(str::to_string),
            run_id: None,
            internal: false,
        }
    }

    #[tokio::test]
    async fn append_writes_one_ndjson_line_per_call() {
        let dir = tempdir().unwrap();
        let ledger = UsageLedger::new(dir.path().join("ledger.ndjson"));
        ledger.append(entry("m1", Some("doc1"), 100)).await.unwrap();
        ledger.append(entry("m1", Some("doc2"), 50)).await.unwrap();

        let content = tokio::fs::read_to_string(dir.path().join("ledger.ndjson")).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn totals_by_model_aggregates_across_entries() {
        let dir = tempdir().unwrap();
        let ledger = UsageLedger::new(dir.path().join("ledger.ndjson"));
        ledger.append(entry("m1", Some("doc1"), 100)).await.unwrap();
        ledger.append(entry("m1", Some("doc2"), 50)).await.unwrap();
        ledger.append(entry("m2", Some("doc1"), 10)).await.unwrap();

        let totals = ledger.totals_by_model().await.unwrap();
        assert_eq!(totals["m1"].total_tokens, 150);
        assert_eq!(totals["m1"].calls, 2);
        assert_eq!(totals["m2"].total_tokens, 10);
    }

    #[tokio::test]
    async fn totals_by_doc_ignores_entries_without_doc_id() {
        let dir = tempdir().unwrap();
        let ledger = UsageLedger::new(dir.path().join("ledger.ndjson"));
        ledger.append(entry("m1", Some("doc1"), 100)).await.unwrap();
        ledger.append(entry("m1", None, 999)).await.unwrap();

        let totals = ledger.totals_by_doc().await.unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals["doc1"].total_tokens, 100);
    }

    #[tokio::test]
    async fn missing_ledger_file_yields_empty_totals() {
        let dir = tempdir().unwrap();
        let ledger = UsageLedger::new(dir.path().join("missing.ndjson"));
        assert!(ledger.totals_by_model().await.unwrap().is_empty());
    }
}
