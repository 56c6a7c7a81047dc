//! In-process score store

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{HighScore, ScoreStore, StoreResult};

/// Score store kept in process memory; the record is lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: RwLock<Option<HighScore>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScoreStore for MemoryStore {
    async fn set(&self, score: HighScore) -> StoreResult<()> {
        *self.slot.write().await = Some(score);
        Ok(())
    }

    async fn get(&self) -> StoreResult<Option<HighScore>> {
        Ok(self.slot.read().await.clone())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
