pub mod assistant;
pub mod board;
pub mod credentials;
pub mod db;
pub mod description;
pub mod errors;
pub mod models;
pub mod redaction;
pub mod slots;
pub mod sync;
pub mod ticker;

use crate::assistant::client::{CompletionClient, HttpCompletionClient};
use crate::assistant::AssistantBridge;
use crate::credentials::CredentialStore;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::AppSettings;
use crate::sync::{BoardSession, Reconciler};
use crate::ticker::Ticker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

const DATABASE_FILE: &str = "focus-board.sqlite";

/// Process-level wiring: the store, the primary session, the shared ticker,
/// the change-feed reconcilers and the assistant.
pub struct BoardApp {
    data_dir: PathBuf,
    db: Arc<Database>,
    settings: AppSettings,
    session: BoardSession,
    assistant: AssistantBridge,
    ticker: Ticker,
    credentials: CredentialStore,
    reconcilers: Mutex<Vec<Reconciler>>,
}

impl BoardApp {
    /// Opens the store under `data_dir` and starts the background tasks,
    /// talking to the configured completion endpoint.
    pub async fn start(data_dir: &Path, user_id: &str) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db = Arc::new(Database::new(&data_dir.join(DATABASE_FILE))?);
        let settings = db.get_settings()?.with_env_overrides();
        let credentials = CredentialStore::new();
        let token = credentials.token().await?;
        let client = Arc::new(HttpCompletionClient::new(&settings.completion_url, token)?);
        Self::assemble(data_dir, db, settings, credentials, user_id, client).await
    }

    /// Like [`BoardApp::start`] with a caller-supplied completion client.
    pub async fn start_with_client(
        data_dir: &Path,
        user_id: &str,
        client: Arc<dyn CompletionClient>,
    ) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db = Arc::new(Database::new(&data_dir.join(DATABASE_FILE))?);
        let settings = db.get_settings()?.with_env_overrides();
        Self::assemble(data_dir, db, settings, CredentialStore::new(), user_id, client).await
    }

    async fn assemble(
        data_dir: &Path,
        db: Arc<Database>,
        settings: AppSettings,
        credentials: CredentialStore,
        user_id: &str,
        client: Arc<dyn CompletionClient>,
    ) -> AppResult<Self> {
        let session = BoardSession::open(db.clone(), user_id, &settings).await?;
        let ticker = Ticker::new();
        ticker.register(session.clone()).await;
        ticker.start().await;
        let reconciler = Reconciler::spawn(&session);
        let assistant = AssistantBridge::new(session.clone(), client, &settings);

        tracing::info!(user_id = %session.user_id(), data_dir = %data_dir.display(), "board started");
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            db,
            settings,
            session,
            assistant,
            ticker,
            credentials,
            reconcilers: Mutex::new(vec![reconciler]),
        })
    }

    pub fn session(&self) -> &BoardSession {
        &self.session
    }

    pub fn assistant(&self) -> &AssistantBridge {
        &self.assistant
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Opens another device session for the same store, ticking and
    /// reconciling alongside the primary one.
    pub async fn connect_session(&self, user_id: &str) -> AppResult<BoardSession> {
        let session = BoardSession::open(self.db.clone(), user_id, &self.settings).await?;
        self.ticker.register(session.clone()).await;
        self.reconcilers.lock().await.push(Reconciler::spawn(&session));
        Ok(session)
    }

    /// Stops ticking and reconciling a session opened with
    /// [`BoardApp::connect_session`]. The primary session stays attached.
    pub async fn disconnect_session(&self, session: &BoardSession) -> AppResult<()> {
        if session.origin() == self.session.origin() {
            return Err(AppError::Validation("The primary session cannot be disconnected".to_string()));
        }
        self.ticker.unregister(session.origin()).await;
        self.reconcilers.lock().await.retain(|reconciler| {
            if reconciler.origin() != session.origin() {
                return true;
            }
            reconciler.stop();
            false
        });
        tracing::info!(user_id = %session.user_id(), origin = %session.origin(), "session disconnected");
        Ok(())
    }

    /// Merges `update` into the stored settings. Timing changes apply to
    /// sessions opened afterwards.
    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        self.db.update_settings(update)
    }

    pub fn stored_settings(&self) -> AppResult<AppSettings> {
        self.db.get_settings()
    }

    pub async fn shutdown(&self) {
        self.assistant.cancel().await;
        self.ticker.stop().await;
        for reconciler in self.reconcilers.lock().await.drain(..) {
            reconciler.stop();
        }
        tracing::info!(user_id = %self.session.user_id(), "board stopped");
    }
}

/// Installs JSON logging into `<data_dir>/logs`, rotated daily.
pub fn init_tracing(data_dir: &Path) -> AppResult<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "focus-board.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
