use std::sync::Arc;

use crate::bus::EventBus;
use crate::config::Config;
use crate::services::ConversationService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ConversationService>,
    pub bus: Arc<dyn EventBus>,
    pub config: Arc<Config>,
}
