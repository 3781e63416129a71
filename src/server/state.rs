use axum::extract::FromRef;

use crate::operations_manager::OperationsManager;
use crate::processor::OnDemandSignal;
use crate::registry::{ApplicationSource, WebhookSource};
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedOperationsManager = Arc<OperationsManager>;
pub type GuardedWebhookSource = Arc<dyn WebhookSource>;
pub type GuardedApplicationSource = Arc<dyn ApplicationSource>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub operations_manager: GuardedOperationsManager,
    pub webhooks: GuardedWebhookSource,
    pub applications: GuardedApplicationSource,
    pub on_demand: OnDemandSignal,
    pub hash: String,
}

impl FromRef<ServerState> for GuardedOperationsManager {
    fn from_ref(input: &ServerState) -> Self {
        input.operations_manager.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for OnDemandSignal {
    fn from_ref(input: &ServerState) -> Self {
        input.on_demand.clone()
    }
}
