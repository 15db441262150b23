use std::sync::Arc;

use crate::clock::Clock;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::services::chat_service::ChatAssistant;
use crate::services::LedgerPolicy;
use crate::store::Store;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn EventBus>,
    pub clock: Arc<dyn Clock>,
    pub policy: LedgerPolicy,
    pub chat: Arc<ChatAssistant>,
    pub metrics: Metrics,
}
