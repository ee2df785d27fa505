//! Background token refresher.
//!
//! One task owns the refresh cycle: on a timer tick (when auto-update is
//! enabled) or a force-update signal it logs every stored account into the
//! upstream, writes the minted tokens to the token file (atomic rename) and
//! atomically replaces the pool. A refresh that yields zero tokens leaves
//! both the file and the pool untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::pool::TokenPool;
use crate::store::{self, AccountRecord};

/// Login seam: the upstream sign-in exchange, one account in, one bearer
/// token out. Implemented by the relay's upstream client; mocked in tests.
#[async_trait]
pub trait AccountLogin: Send + Sync {
    async fn login(&self, account: &AccountRecord) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct RefresherSettings {
    pub tokens_file: String,
    pub accounts_file: String,
    pub interval: Duration,
    /// Whether the periodic timer runs. Force-update works either way.
    pub enabled: bool,
}

/// Snapshot served by the updater status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RefresherStatus {
    pub enabled: bool,
    pub in_progress: bool,
    pub last_run_at: Option<String>,
    pub last_result: Option<String>,
    pub next_run_at: Option<String>,
}

#[derive(Default)]
struct StatusInner {
    in_progress: bool,
    last_run_at: Option<DateTime<Utc>>,
    last_result: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
}

struct Shared {
    pool: Arc<TokenPool>,
    login: Arc<dyn AccountLogin>,
    settings: RefresherSettings,
    status: Mutex<StatusInner>,
    wake: Notify,
    pending: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct TokenRefresher {
    shared: Arc<Shared>,
}

impl TokenRefresher {
    pub fn new(
        pool: Arc<TokenPool>,
        login: Arc<dyn AccountLogin>,
        settings: RefresherSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                login,
                settings,
                status: Mutex::new(StatusInner::default()),
                wake: Notify::new(),
                pending: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the background task. The task idles on the force-update signal
    /// alone when auto-update is disabled.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(run(shared))
    }

    /// Schedule an immediate refresh and return. Overlapping requests
    /// coalesce: at most one refresh runs at a time, and calls arriving
    /// during a run trigger exactly one follow-up run.
    pub fn force_update(&self) {
        self.shared.pending.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Cancel the background task. An in-flight refresh runs to completion.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// Run one refresh to completion on the calling task.
    pub async fn refresh_once(&self) {
        refresh_once(&self.shared).await;
    }

    pub fn status(&self) -> RefresherStatus {
        let inner = self.shared.status.lock().unwrap();
        RefresherStatus {
            enabled: self.shared.settings.enabled,
            in_progress: inner.in_progress,
            last_run_at: inner.last_run_at.map(|t| t.to_rfc3339()),
            last_result: inner.last_result.clone(),
            next_run_at: inner.next_run_at.map(|t| t.to_rfc3339()),
        }
    }
}

async fn run(shared: Arc<Shared>) {
    let period = shared.settings.interval;
    let mut timer = shared.settings.enabled.then(|| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });
    if shared.settings.enabled {
        let mut status = shared.status.lock().unwrap();
        status.next_run_at = Some(Utc::now() + next_period(period));
    }
    info!(
        enabled = shared.settings.enabled,
        interval_secs = period.as_secs(),
        "token refresher started"
    );

    loop {
        let forced = tokio::select! {
            _ = shared.cancel.cancelled() => {
                info!("token refresher stopped");
                return;
            }
            _ = shared.wake.notified() => true,
            _ = tick(&mut timer) => {
                let mut status = shared.status.lock().unwrap();
                status.next_run_at = Some(Utc::now() + next_period(period));
                false
            }
        };

        // A wake whose pending flag was already drained belongs to a run
        // that has completed; skip it.
        if forced && !shared.pending.swap(false, Ordering::SeqCst) {
            continue;
        }

        refresh_once(&shared).await;
        while shared.pending.swap(false, Ordering::SeqCst) {
            refresh_once(&shared).await;
        }
    }
}

fn next_period(period: Duration) -> chrono::Duration {
    chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero())
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn refresh_once(shared: &Shared) {
    shared.status.lock().unwrap().in_progress = true;

    let outcome = perform_refresh(shared).await;

    let mut status = shared.status.lock().unwrap();
    status.in_progress = false;
    status.last_run_at = Some(Utc::now());
    status.last_result = Some(match outcome {
        Ok(count) => format!("ok: {count} tokens"),
        Err(ref e) => format!("error: {e}"),
    });
}

async fn perform_refresh(shared: &Shared) -> Result<usize> {
    let accounts = match store::read_accounts(&shared.settings.accounts_file) {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(error = %e, "accounts file unreadable, skipping refresh");
            return Err(e);
        }
    };
    if accounts.is_empty() {
        warn!(
            path = %shared.settings.accounts_file,
            "accounts file has no records, skipping refresh"
        );
        return Err(PoolError::NoTokens("no accounts configured".to_string()));
    }

    let mut tokens = Vec::new();
    for account in &accounts {
        match shared.login.login(account).await {
            Ok(token) => {
                debug!(email = %account.email, "minted upstream token");
                tokens.push(token);
            }
            Err(e) => warn!(email = %account.email, error = %e, "account login failed, skipping"),
        }
    }

    if tokens.is_empty() {
        return Err(PoolError::NoTokens(format!(
            "no logins succeeded across {} accounts",
            accounts.len()
        )));
    }

    // File first, then pool: a crash between the two leaves the file ahead
    // of the pool, which the next reload reconciles.
    store::write_tokens(&shared.settings.tokens_file, &tokens)?;
    let count = tokens.len();
    shared.pool.replace(tokens);
    info!(tokens = count, "token pool refreshed from accounts");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Mints `minted-<email>` for every account except those listed in
    /// `failing`.
    struct ScriptedLogin {
        failing: HashSet<String>,
    }

    impl ScriptedLogin {
        fn new(failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    #[async_trait]
    impl AccountLogin for ScriptedLogin {
        async fn login(&self, account: &AccountRecord) -> Result<String> {
            if self.failing.contains(&account.email) {
                return Err(PoolError::Login {
                    email: account.email.clone(),
                    reason: "invalid credentials".to_string(),
                });
            }
            Ok(format!("minted-{}", account.email))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        tokens_file: String,
        refresher: TokenRefresher,
        pool: Arc<TokenPool>,
    }

    fn fixture(accounts: &str, login: Arc<ScriptedLogin>, enabled: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let tokens_file = dir.path().join("tokens.txt").to_str().unwrap().to_string();
        let accounts_file = dir.path().join("accounts.txt").to_str().unwrap().to_string();
        std::fs::write(&tokens_file, "stale-token\n").unwrap();
        if !accounts.is_empty() {
            std::fs::write(&accounts_file, accounts).unwrap();
        }

        let pool = Arc::new(TokenPool::new(vec!["stale-token".to_string()], 3));
        let refresher = TokenRefresher::new(
            pool.clone(),
            login,
            RefresherSettings {
                tokens_file: tokens_file.clone(),
                accounts_file,
                interval: Duration::from_secs(3600),
                enabled,
            },
        );
        Fixture {
            _dir: dir,
            tokens_file,
            refresher,
            pool,
        }
    }

    #[tokio::test]
    async fn refresh_replaces_pool_and_rewrites_file() {
        let fx = fixture(
            "{\"email\":\"a@x.io\",\"password\":\"p\"}\n{\"email\":\"b@x.io\",\"password\":\"p\"}\n",
            ScriptedLogin::new(&[]),
            false,
        );
        fx.refresher.refresh_once().await;

        assert_eq!(fx.pool.len(), 2);
        assert_eq!(
            store::read_tokens(&fx.tokens_file).unwrap(),
            ["minted-a@x.io", "minted-b@x.io"]
        );
        let status = fx.refresher.status();
        assert_eq!(status.last_result.as_deref(), Some("ok: 2 tokens"));
        assert!(status.last_run_at.is_some());
        assert!(!status.in_progress);
    }

    #[tokio::test]
    async fn partial_login_failures_are_tolerated() {
        let fx = fixture(
            "{\"email\":\"a@x.io\",\"password\":\"p\"}\n{\"email\":\"b@x.io\",\"password\":\"p\"}\n",
            ScriptedLogin::new(&["a@x.io"]),
            false,
        );
        fx.refresher.refresh_once().await;

        assert_eq!(fx.pool.len(), 1);
        assert_eq!(
            store::read_tokens(&fx.tokens_file).unwrap(),
            ["minted-b@x.io"]
        );
    }

    #[tokio::test]
    async fn zero_tokens_leaves_pool_and_file_untouched() {
        let fx = fixture(
            "{\"email\":\"a@x.io\",\"password\":\"p\"}\n",
            ScriptedLogin::new(&["a@x.io"]),
            false,
        );
        fx.refresher.refresh_once().await;

        assert_eq!(fx.pool.len(), 1);
        assert_eq!(store::read_tokens(&fx.tokens_file).unwrap(), ["stale-token"]);
        let status = fx.refresher.status();
        assert!(status.last_result.unwrap().starts_with("error:"));
    }

    #[tokio::test]
    async fn missing_accounts_file_skips_without_touching_pool() {
        let fx = fixture("", ScriptedLogin::new(&[]), false);
        fx.refresher.refresh_once().await;

        assert_eq!(fx.pool.len(), 1);
        assert_eq!(store::read_tokens(&fx.tokens_file).unwrap(), ["stale-token"]);
    }

    #[tokio::test]
    async fn force_update_drives_background_task() {
        let fx = fixture(
            "{\"email\":\"a@x.io\",\"password\":\"p\"}\n",
            ScriptedLogin::new(&[]),
            false,
        );
        let handle = fx.refresher.start();
        fx.refresher.force_update();

        let mut refreshed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if fx.refresher.status().last_run_at.is_some() {
                refreshed = true;
                break;
            }
        }
        assert!(refreshed, "forced refresh never ran");
        assert_eq!(
            store::read_tokens(&fx.tokens_file).unwrap(),
            ["minted-a@x.io"]
        );

        fx.refresher.stop();
        let _ = handle.await;
    }
}
