use config::{Config, ConfigError, Environment, File};
use pipecat_core::{CONTENT_TYPE_TEXT_PLAIN, DEFAULT_AMQP_URI};
use pipecat_node::config::{AckSourceKind, BridgeConfig};
use pipecat_node::mode::ModeSelection;
use pipecat_node::pending::KeyStrategy;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct PipecatConfig {
    pub amqp_uri: String,
    pub mode: ModeSelection,
    pub pending_key: KeyStrategy,
    pub ack_source: AckSourceKind,
    pub consumer_tag: String,
    pub content_type: String,
    pub prefetch: u16,
    pub durable: bool,
}

impl PipecatConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("amqp_uri", DEFAULT_AMQP_URI)?
            .set_default("mode", "auto")?
            .set_default("pending_key", "content")?
            .set_default("ack_source", "none")?
            .set_default("consumer_tag", "")?
            .set_default("content_type", CONTENT_TYPE_TEXT_PLAIN)?
            .set_default("prefetch", 0)?
            .set_default("durable", true)?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // .env files feed the PIPECAT_* environment source below.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("PIPECAT").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            key_strategy: self.pending_key,
            ack_source: self.ack_source.clone(),
            consumer_tag: self.consumer_tag.clone(),
            content_type: self.content_type.clone(),
            prefetch: self.prefetch,
            durable: self.durable,
        }
    }
}
