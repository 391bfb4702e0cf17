//! Shared engine state.

use shipyard_config::EngineConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::store::JobStore;

/// What every pool and handler of one engine instance shares: the job store,
/// the configuration and the root shutdown token.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn JobStore>,
    pub config: Arc<EngineConfig>,
    pub shutdown: CancellationToken,
    /// Prefix for the worker ids of this process.
    pub instance_id: String,
}

impl EngineContext {
    pub fn new(config: EngineConfig, store: Arc<dyn JobStore>) -> Self {
        let suffix = uuid::Uuid::now_v7().simple().to_string();
        Self {
            store,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            instance_id: format!("shipyard-{}", &suffix[suffix.len() - 8..]),
        }
    }
}
