use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};
use regex::Regex;

use crate::usage_store::{UsageSnapshot, UsageStore};

fn custom_emoji_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<a?:([A-Za-z0-9_]+):[0-9]+>").expect("custom emoji pattern is valid")
    })
}

fn shortcode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r":([a-z0-9_+\-]+):").expect("shortcode pattern is valid")
    })
}

/// Extracts emoji reference names from message text: platform custom
/// references (`<:name:id>` / `<a:name:id>`) and plain `:shortcode:` forms.
pub fn extract_emoji_references(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let stripped = custom_emoji_pattern().replace_all(text, |captures: &regex::Captures<'_>| {
        names.push(captures[1].to_string());
        String::new()
    });
    for captures in shortcode_pattern().captures_iter(&stripped) {
        names.push(captures[1].to_string());
    }
    names
}

/// In-memory per-tenant emoji counters, flushed to the usage store by the
/// autosave task and restored from the last snapshot at startup.
pub struct EmojiUsageCollector {
    store: Arc<dyn UsageStore>,
    counters: Mutex<UsageSnapshot>,
    dirty: AtomicBool,
}

impl EmojiUsageCollector {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store,
            counters: Mutex::new(UsageSnapshot::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Restores counters from the persisted snapshot.
    pub fn load_snapshot(&self) -> Result<usize> {
        let snapshot = self.store.load().context("failed to load usage snapshot")?;
        let tenant_count = snapshot.len();
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| anyhow::anyhow!("usage counters lock poisoned"))?;
        *counters = snapshot;
        Ok(tenant_count)
    }

    /// Counts every emoji reference in `text` against the tenant. Returns
    /// the number of references recorded.
    pub fn record_message(&self, tenant_id: &str, text: &str) -> usize {
        let names = extract_emoji_references(text);
        if names.is_empty() || tenant_id.trim().is_empty() {
            return 0;
        }
        let Ok(mut counters) = self.counters.lock() else {
            return 0;
        };
        let tenant = counters.entry(tenant_id.to_string()).or_default();
        for name in &names {
            let slot = tenant.entry(name.clone()).or_insert(0);
            *slot = slot.saturating_add(1);
        }
        self.dirty.store(true, Ordering::SeqCst);
        names.len()
    }

    pub fn usage_snapshot(&self, tenant_id: &str) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .ok()
            .and_then(|counters| counters.get(tenant_id).cloned())
            .unwrap_or_default()
    }

    /// Renders a usage report for one tenant, highest counts first.
    pub fn render_report(&self, tenant_id: &str, top_n: usize) -> String {
        let usage = self.usage_snapshot(tenant_id);
        if usage.is_empty() {
            return "emoji usage: none recorded".to_string();
        }
        let mut rows: Vec<(String, u64)> = usage.into_iter().collect();
        rows.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(&right.0)));
        rows.truncate(top_n.max(1));
        let mut lines = vec!["emoji usage:".to_string()];
        for (name, count) in rows {
            lines.push(format!("  :{name}: x{count}"));
        }
        lines.join("\n")
    }

    /// Clears one tenant's counters and flushes immediately so the reset
    /// survives a crash before the next autosave tick.
    pub fn reset_tenant(&self, tenant_id: &str) -> Result<u64> {
        let removed = {
            let mut counters = self
                .counters
                .lock()
                .map_err(|_| anyhow::anyhow!("usage counters lock poisoned"))?;
            counters
                .remove(tenant_id)
                .map(|tenant| tenant.values().sum())
                .unwrap_or(0)
        };
        self.dirty.store(true, Ordering::SeqCst);
        self.flush()?;
        Ok(removed)
    }

    pub fn remove_tenant(&self, tenant_id: &str) -> Result<()> {
        self.reset_tenant(tenant_id).map(|_| ())
    }

    /// Persists the current counters when anything changed since the last
    /// flush. Returns true when a snapshot was written.
    pub fn flush(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let snapshot = {
            let counters = self
                .counters
                .lock()
                .map_err(|_| anyhow::anyhow!("usage counters lock poisoned"))?;
            counters.clone()
        };
        if let Err(error) = self.store.save(&snapshot) {
            // Keep the dirty bit so the next tick retries.
            self.dirty.store(true, Ordering::SeqCst);
            return Err(error).context("failed to persist usage snapshot");
        }
        Ok(true)
    }
}
