// Runtime configuration: CLI flags + the authorized-gateway table.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use ssgs_protocol::{GatewayUid, Key};

#[derive(Parser, Debug, Clone)]
#[command(name = "gateway_server", about = "Sensor Seal Gateway Server")]
pub struct Cli {
    /// Path to the authorized-gateway table.
    #[arg(long, default_value = "./config.json")]
    pub config: PathBuf,

    /// UDP bind address.
    #[arg(long, default_value = "0.0.0.0:1818")]
    pub bind: String,

    /// Log per-datagram protocol decisions (drops, dedup hits, retransmits).
    #[arg(long)]
    pub debug: bool,
}

#[derive(Deserialize)]
struct ConfigFile {
    authorized_gateways: Vec<GatewayEntry>,
}

#[derive(Deserialize)]
struct GatewayEntry {
    uid: String,
    key: String,
}

/// UID → pre-shared key. Built once at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct GatewayTable {
    keys: HashMap<GatewayUid, Key>,
}

impl GatewayTable {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(data: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(data)?;
        let mut keys = HashMap::with_capacity(file.authorized_gateways.len());
        for (i, entry) in file.authorized_gateways.iter().enumerate() {
            let uid = GatewayUid::from_hex(&entry.uid)
                .map_err(|e| anyhow::anyhow!("gateway #{i}: uid: {e}"))?;
            let key_hex: String = entry.key.chars().filter(|c| !c.is_whitespace()).collect();
            let key_bytes =
                hex::decode(&key_hex).map_err(|e| anyhow::anyhow!("gateway #{i}: key: {e}"))?;
            let key: Key = key_bytes.try_into().map_err(|v: Vec<u8>| {
                anyhow::anyhow!("gateway #{i}: key must be 32 bytes, got {}", v.len())
            })?;
            if keys.insert(uid, key).is_some() {
                bail!("gateway #{i}: duplicate uid {uid}");
            }
        }
        Ok(Self { keys })
    }

    pub fn key_for(&self, uid: &GatewayUid) -> Option<&Key> {
        self.keys.get(uid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
