//! Per-account usage counters.
//!
//! Counts chat requests, web-search requests/results, and token totals per
//! account per UTC day. All mutation flows through a single writer task fed
//! by a channel, so increments never race; the file on disk is flushed at
//! most once per second plus a forced flush at shutdown, always via
//! write-temp + rename.

pub mod stats;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};

/// Which counter a forwarded request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    WebSearch,
}

/// One account's usage for one UTC day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DayUsage {
    pub chat_requests: u64,
    pub web_search_requests: u64,
    pub web_search_results: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DayRequests {
    chat_requests: u64,
    web_search_requests: u64,
    web_search_results: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenDay {
    date: String,
    input_tokens: u64,
    output_tokens: u64,
}

/// The persisted counter file. Field names match the historical layout;
/// `requestHistory` keeps per-day request counts queryable after rollover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountersFile {
    #[serde(default)]
    last_reset_date: String,
    #[serde(default)]
    requests: HashMap<String, u64>,
    #[serde(default)]
    web_search_requests: HashMap<String, u64>,
    #[serde(default)]
    web_search_results: HashMap<String, u64>,
    #[serde(default)]
    request_history: HashMap<String, HashMap<String, DayRequests>>,
    #[serde(default)]
    token_usage: HashMap<String, Vec<TokenDay>>,
}

impl CountersFile {
    /// Roll the live maps into history when the UTC date has advanced.
    fn ensure_today(&mut self, today: &str) {
        if self.last_reset_date == today {
            return;
        }
        if !self.last_reset_date.is_empty() {
            let mut day: HashMap<String, DayRequests> = HashMap::new();
            for (account, n) in self.requests.drain() {
                day.entry(account).or_default().chat_requests = n;
            }
            for (account, n) in self.web_search_requests.drain() {
                day.entry(account).or_default().web_search_requests = n;
            }
            for (account, n) in self.web_search_results.drain() {
                day.entry(account).or_default().web_search_results = n;
            }
            if !day.is_empty() {
                self.request_history
                    .insert(std::mem::take(&mut self.last_reset_date), day);
            }
        }
        self.requests.clear();
        self.web_search_requests.clear();
        self.web_search_results.clear();
        self.last_reset_date = today.to_string();
    }

    fn tokens_for(&self, account: &str, date: &str) -> (u64, u64) {
        self.token_usage
            .get(account)
            .and_then(|days| days.iter().find(|d| d.date == date))
            .map(|d| (d.input_tokens, d.output_tokens))
            .unwrap_or((0, 0))
    }
}

#[derive(Debug)]
enum CounterEvent {
    Request {
        account_id: String,
        kind: RequestKind,
        count: u64,
    },
    SearchResults {
        account_id: String,
        count: u64,
    },
    Tokens {
        account_id: String,
        input: u64,
        output: u64,
    },
    Flush {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the counters subsystem. Cloneable increments, snapshot reads.
pub struct UsageCounters {
    tx: mpsc::UnboundedSender<CounterEvent>,
    state: Arc<RwLock<CountersFile>>,
}

impl UsageCounters {
    /// Load the counter file and spawn the single writer task.
    pub fn start(path: PathBuf) -> Arc<Self> {
        let loaded = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Counter file unreadable, starting fresh");
                CountersFile::default()
            }),
            Err(_) => CountersFile::default(),
        };
        let state = Arc::new(RwLock::new(loaded));
        let (tx, rx) = mpsc::unbounded_channel();

        let writer_state = Arc::clone(&state);
        tokio::spawn(writer_task(writer_state, path, rx));

        Arc::new(Self { tx, state })
    }

    pub fn incr_request(&self, account_id: &str, kind: RequestKind) {
        let _ = self.tx.send(CounterEvent::Request {
            account_id: account_id.to_string(),
            kind,
            count: 1,
        });
    }

    pub fn incr_search_results(&self, account_id: &str, count: u64) {
        if count == 0 {
            return;
        }
        let _ = self.tx.send(CounterEvent::SearchResults {
            account_id: account_id.to_string(),
            count,
        });
    }

    pub fn incr_tokens(&self, account_id: &str, input: u64, output: u64) {
        if input == 0 && output == 0 {
            return;
        }
        let _ = self.tx.send(CounterEvent::Tokens {
            account_id: account_id.to_string(),
            input,
            output,
        });
    }

    /// Force a flush to disk and wait for it.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(CounterEvent::Flush { ack }).is_ok() {
            let _ = done.await;
        }
    }

    /// Today's usage for one account. Rollover is handled on read: a state
    /// whose reset date lags today reports zeros for request counters.
    pub async fn get_today(&self, account_id: &str) -> DayUsage {
        let today = today_utc();
        let state = self.state.read().await;
        let (input_tokens, output_tokens) = state.tokens_for(account_id, &today);
        if state.last_reset_date != today {
            return DayUsage {
                input_tokens,
                output_tokens,
                ..Default::default()
            };
        }
        DayUsage {
            chat_requests: state.requests.get(account_id).copied().unwrap_or(0),
            web_search_requests: state
                .web_search_requests
                .get(account_id)
                .copied()
                .unwrap_or(0),
            web_search_results: state
                .web_search_results
                .get(account_id)
                .copied()
                .unwrap_or(0),
            input_tokens,
            output_tokens,
        }
    }

    /// Full per-day history for one account, oldest first.
    pub async fn get_all_days(&self, account_id: &str) -> BTreeMap<String, DayUsage> {
        let today = today_utc();
        let state = self.state.read().await;
        let mut days: BTreeMap<String, DayUsage> = BTreeMap::new();

        for (date, accounts) in &state.request_history {
            if let Some(reqs) = accounts.get(account_id) {
                let entry = days.entry(date.clone()).or_default();
                entry.chat_requests = reqs.chat_requests;
                entry.web_search_requests = reqs.web_search_requests;
                entry.web_search_results = reqs.web_search_results;
            }
        }
        if state.last_reset_date == today {
            let entry = days.entry(today.clone()).or_default();
            entry.chat_requests = state.requests.get(account_id).copied().unwrap_or(0);
            entry.web_search_requests = state
                .web_search_requests
                .get(account_id)
                .copied()
                .unwrap_or(0);
            entry.web_search_results = state
                .web_search_results
                .get(account_id)
                .copied()
                .unwrap_or(0);
        }
        if let Some(token_days) = state.token_usage.get(account_id) {
            for day in token_days {
                let entry = days.entry(day.date.clone()).or_default();
                entry.input_tokens = day.input_tokens;
                entry.output_tokens = day.output_tokens;
            }
        }
        days
    }

    /// Today's usage for every account that has any (for health and stats).
    pub async fn snapshot_today(&self) -> HashMap<String, DayUsage> {
        let today = today_utc();
        let state = self.state.read().await;
        let mut accounts: HashMap<String, DayUsage> = HashMap::new();

        if state.last_reset_date == today {
            for (account, n) in &state.requests {
                accounts.entry(account.clone()).or_default().chat_requests = *n;
            }
            for (account, n) in &state.web_search_requests {
                accounts
                    .entry(account.clone())
                    .or_default()
                    .web_search_requests = *n;
            }
            for (account, n) in &state.web_search_results {
                accounts
                    .entry(account.clone())
                    .or_default()
                    .web_search_results = *n;
            }
        }
        for (account, token_days) in &state.token_usage {
            if let Some(day) = token_days.iter().find(|d| d.date == today) {
                let entry = accounts.entry(account.clone()).or_default();
                entry.input_tokens = day.input_tokens;
                entry.output_tokens = day.output_tokens;
            }
        }
        accounts
    }

    /// Today's usage summed across accounts.
    pub async fn totals_today(&self) -> DayUsage {
        let mut total = DayUsage::default();
        for usage in self.snapshot_today().await.values() {
            total.chat_requests += usage.chat_requests;
            total.web_search_requests += usage.web_search_requests;
            total.web_search_results += usage.web_search_results;
            total.input_tokens += usage.input_tokens;
            total.output_tokens += usage.output_tokens;
        }
        total
    }
}

fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

async fn writer_task(
    state: Arc<RwLock<CountersFile>>,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<CounterEvent>,
) {
    let mut flush_tick = tokio::time::interval(Duration::from_secs(1));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut dirty = false;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(CounterEvent::Flush { ack }) => {
                        persist(&state, &path).await;
                        dirty = false;
                        let _ = ack.send(());
                    }
                    Some(event) => {
                        apply(&state, event).await;
                        dirty = true;
                    }
                    None => {
                        if dirty {
                            persist(&state, &path).await;
                        }
                        break;
                    }
                }
            }
            _ = flush_tick.tick() => {
                if dirty {
                    persist(&state, &path).await;
                    dirty = false;
                }
            }
        }
    }
}

async fn apply(state: &RwLock<CountersFile>, event: CounterEvent) {
    let today = today_utc();
    let mut file = state.write().await;
    file.ensure_today(&today);
    match event {
        CounterEvent::Request {
            account_id,
            kind,
            count,
        } => {
            let map = match kind {
                RequestKind::Chat => &mut file.requests,
                RequestKind::WebSearch => &mut file.web_search_requests,
            };
            *map.entry(account_id).or_insert(0) += count;
        }
        CounterEvent::SearchResults { account_id, count } => {
            *file.web_search_results.entry(account_id).or_insert(0) += count;
        }
        CounterEvent::Tokens {
            account_id,
            input,
            output,
        } => {
            let days = file.token_usage.entry(account_id).or_default();
            match days.iter_mut().find(|d| d.date == today) {
                Some(day) => {
                    day.input_tokens += input;
                    day.output_tokens += output;
                }
                None => days.push(TokenDay {
                    date: today.clone(),
                    input_tokens: input,
                    output_tokens: output,
                }),
            }
        }
        CounterEvent::Flush { .. } => {}
    }
}

async fn persist(state: &RwLock<CountersFile>, path: &PathBuf) {
    let snapshot = state.read().await.clone();
    if let Err(e) = write_atomic(path, &snapshot) {
        tracing::error!(path = %path.display(), error = %e, "Failed to persist usage counters");
    }
}

fn write_atomic(path: &PathBuf, file: &CountersFile) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(file)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
