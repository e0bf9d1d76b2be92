use crate::ids::IdAllocator;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Runtime configuration for the generator service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    /// Fixed identifier base; when unset every request seeds from the clock.
    #[serde(default)]
    pub id_base: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: false,
            id_base: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("failed to parse BIND_ADDR")?;

        let enable_cors = std::env::var("ENABLE_CORS")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        let id_base = std::env::var("SCROLL_GENIUS_ID_BASE")
            .ok()
            .map(|v| parse_id_base(&v))
            .transpose()
            .context("failed to parse SCROLL_GENIUS_ID_BASE")?;

        Ok(Self {
            bind_addr,
            enable_cors,
            id_base,
        })
    }
}

fn parse_id_base(value: &str) -> anyhow::Result<u64> {
    let base = value.trim().parse::<u64>()?;
    IdAllocator::with_base(base)?;
    Ok(base)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
