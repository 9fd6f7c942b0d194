/// Configuration (spec §10.2, §6): a TOML file loaded into a process-wide
/// `OnceCell`, overridable at the command line for the handful of options
/// an operator most often needs.
pub use config::Config;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::error::Error;

static GLOBAL_CONFIG: OnceCell<Settings> = OnceCell::new();

/// Recognized options, mirroring spec §6.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub btc_peer: String,
    pub btc_port: u16,
    #[serde(default)]
    pub btc_data: String,
    #[serde(default = "default_comb_host")]
    pub comb_host: String,
    #[serde(default = "default_comb_port")]
    pub comb_port: u16,
    #[serde(default = "default_network")]
    pub comb_network: String,
    #[serde(default)]
    pub comb_fingerprint_index: bool,
}

fn default_comb_host() -> String {
    "127.0.0.1".to_string()
}

fn default_comb_port() -> u16 {
    7080
}

fn default_network() -> String {
    "mainnet".to_string()
}

impl Settings {
    /// Resolves the REST base URL this crate's block source talks to.
    pub fn rest_base_url(&self) -> String {
        format!("http://{}:{}/rest", self.btc_peer, self.btc_port)
    }

    /// Expands `~`/`$HOME`-style entries; empty means the direct source is
    /// disabled.
    pub fn btc_data_dir(&self) -> Option<std::path::PathBuf> {
        if self.btc_data.trim().is_empty() {
            return None;
        }
        shellexpand::full(&self.btc_data).ok().map(|expanded| std::path::PathBuf::from(expanded.into_owned()))
    }

    pub fn network(&self) -> Result<crate::constants::Network, String> {
        match self.comb_network.as_str() {
            "mainnet" => Ok(crate::constants::Network::Mainnet),
            "testnet" => Ok(crate::constants::Network::Testnet),
            other => Err(format!("unknown comb_network {other:?}, expected \"mainnet\" or \"testnet\"")),
        }
    }
}

/// CLI overlay (spec §10.2): values here take precedence over the file when
/// both are present.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "combcore", about = "Commitment-chain indexer")]
pub struct Cli {
    #[arg(long = "config", default_value = "config.toml")]
    pub config_path: String,
    #[arg(long = "btc-peer")]
    pub btc_peer: Option<String>,
    #[arg(long = "btc-port")]
    pub btc_port: Option<u16>,
    #[arg(long = "btc-data")]
    pub btc_data: Option<String>,
    #[arg(long = "comb-network")]
    pub comb_network: Option<String>,
}

/// Loads `cli.config_path`, overlays any CLI overrides, and stores the
/// result in the global cell. Must be called exactly once, before any
/// `get_global_config` call.
pub fn init_global_config(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let settings = load_settings(cli)?;
    GLOBAL_CONFIG.set(settings).map_err(|_| "config already initialized")?;
    Ok(())
}

/// Panics with a clear diagnostic rather than returning a confusing `None`
/// if called before `init_global_config`.
pub fn get_global_config() -> &'static Settings {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

fn load_settings(cli: &Cli) -> Result<Settings, Box<dyn Error>> {
    let raw = Config::builder().add_source(config::File::with_name(&cli.config_path)).build()?;
    let mut settings: Settings = raw.try_deserialize()?;

    if let Some(v) = &cli.btc_peer {
        settings.btc_peer = v.clone();
    }
    if let Some(v) = cli.btc_port {
        settings.btc_port = v;
    }
    if let Some(v) = &cli.btc_data {
        settings.btc_data = v.clone();
    }
    if let Some(v) = &cli.comb_network {
        settings.comb_network = v.clone();
    }

    settings.network().map_err(|e| -> Box<dyn Error> { e.into() })?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli { config_path: "config.toml".to_string(), btc_peer: None, btc_port: None, btc_data: None, comb_network: None }
    }

    #[test]
    fn cli_overrides_take_precedence_over_defaults() {
        let settings = Settings {
            btc_peer: "file-peer".to_string(),
            btc_port: 8332,
            btc_data: String::new(),
            comb_host: default_comb_host(),
            comb_port: default_comb_port(),
            comb_network: default_network(),
            comb_fingerprint_index: false,
        };
        assert_eq!(settings.rest_base_url(), "http://file-peer:8332/rest");
        assert!(settings.btc_data_dir().is_none());
    }

    #[test]
    fn unknown_network_is_rejected() {
        let settings = Settings {
            btc_peer: "localhost".to_string(),
            btc_port: 8332,
            btc_data: String::new(),
            comb_host: default_comb_host(),
            comb_port: default_comb_port(),
            comb_network: "regtest".to_string(),
            comb_fingerprint_index: false,
        };
        assert!(settings.network().is_err());
    }

    #[test]
    fn cli_struct_parses_recognized_flags() {
        use clap::Parser;
        let cli = Cli::parse_from(["combcore", "--btc-peer", "1.2.3.4", "--btc-port", "8333"]);
        assert_eq!(cli.btc_peer.as_deref(), Some("1.2.3.4"));
        assert_eq!(cli.btc_port, Some(8333));
        let _ = base_cli();
    }
}
