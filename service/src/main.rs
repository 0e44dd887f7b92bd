use axum::serve;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tutorchat_service::storage::SledArchive;
use tutorchat_service::tutor::HttpTutor;
use tutorchat_service::{
    init_tracing, router, AppConfig, AppState, ConversationStore, DeliveryCoordinator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    let archive = SledArchive::open(&config.data_dir)?;
    let store = Arc::new(ConversationStore::with_archive(Arc::new(archive))?);
    let tutor = HttpTutor::new(config.tutor_url.clone());
    info!(endpoint = %tutor.endpoint(), "tutor boundary configured");

    let (coordinator, mut notices) =
        DeliveryCoordinator::new(store, Arc::new(tutor), config.delivery.clone());
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match &notice.error {
                None => info!(
                    message_id = %notice.message_id,
                    replies = notice.replies.len(),
                    "delivered"
                ),
                Some(err) => warn!(message_id = %notice.message_id, %err, "delivery failed"),
            }
        }
    });

    let state = AppState::new(config.clone(), coordinator);
    let app = router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, build_id = %config.build_id, "starting TutorChat service");

    serve(listener, app).await?;
    Ok(())
}
