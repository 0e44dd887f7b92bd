use crate::delivery::DeliveryConfig;
use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Runtime configuration for the chat service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub build_id: String,
    /// Directory holding the chat history database.
    pub data_dir: PathBuf,
    /// Endpoint of the remote tutor.
    pub tutor_url: String,
    pub delivery: DeliveryConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        let build_id =
            env::var("TUTORCHAT_BUILD_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let data_dir = env::var("TUTORCHAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/tutorchat"));
        let tutor_url = env::var("TUTORCHAT_TUTOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8090/answer".to_string());

        let defaults = DeliveryConfig::default();
        let timeout = parse_var::<u64>("TUTORCHAT_DELIVERY_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout);
        let context_window =
            parse_var::<usize>("TUTORCHAT_CONTEXT_WINDOW")?.unwrap_or(defaults.context_window);

        Ok(Self {
            host,
            port,
            build_id,
            data_dir,
            tutor_url,
            delivery: defaults
                .with_timeout(timeout)
                .with_context_window(context_window),
        })
    }
}

fn parse_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} must be a number, got {raw:?}")),
        Err(_) => Ok(None),
    }
}
