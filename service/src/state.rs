use crate::config::AppConfig;
use crate::delivery::DeliveryCoordinator;
use crate::store::ConversationStore;
use std::sync::Arc;

pub struct AppState {
    config: AppConfig,
    coordinator: DeliveryCoordinator,
}

impl AppState {
    pub fn new(config: AppConfig, coordinator: DeliveryCoordinator) -> Arc<Self> {
        Arc::new(Self {
            config,
            coordinator,
        })
    }

    pub fn build_id(&self) -> &str {
        &self.config.build_id
    }

    pub fn coordinator(&self) -> &DeliveryCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &ConversationStore {
        self.coordinator.store()
    }
}
