pub mod config;
pub mod delivery;
pub mod routes;
pub mod state;
pub mod storage;
pub mod store;
pub mod tutor;

pub use config::AppConfig;
pub use delivery::{DeliveryConfig, DeliveryCoordinator, DeliveryError, DeliveryNotice};
pub use routes::router;
pub use state::AppState;
pub use store::{ConversationStore, StoreError};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
