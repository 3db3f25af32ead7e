use crate::sync::BoardSession;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Shared one-second clock driving every registered session's countdown.
#[derive(Clone, Default)]
pub struct Ticker {
    sessions: Arc<Mutex<Vec<BoardSession>>>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: BoardSession) {
        let mut sessions = self.sessions.lock().await;
        if sessions.iter().any(|known| known.origin() == session.origin()) {
            return;
        }
        sessions.push(session);
    }

    pub async fn unregister(&self, origin: &str) {
        self.sessions.lock().await.retain(|session| session.origin() != origin);
    }

    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let ticker = self.clone();
        *handle = Some(tokio::spawn(async move {
            ticker.run_loop().await;
        }));
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    async fn run_loop(self) {
        let mut interval = tokio::time::interval(TICK_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of an interval completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let sessions = self.sessions.lock().await.clone();
            for session in sessions {
                session.tick().await;
            }
        }
    }
}
