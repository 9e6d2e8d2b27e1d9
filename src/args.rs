use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "rtmp-conn-engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "RTMP connection engine", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rtmp-conn-engine.toml")]
    pub config: PathBuf,

    /// RTMP listen address, overriding server.listen_addr
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// HTTP introspection listen address, overriding http.listen_addr
    #[arg(long)]
    pub http_addr: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Run in foreground (don't daemonize)
    #[arg(long, action)]
    pub foreground: bool,

    /// PID file path
    #[arg(long, default_value = "/var/run/rtmp-conn-engine.pid")]
    pub pidfile: PathBuf,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        let mut config = config::Config::load(&self.config)?;
        if let Some(addr) = &self.listen_addr {
            config.server.listen_addr = addr.clone();
        }
        if let Some(addr) = &self.http_addr {
            config.http.listen_addr = addr.clone();
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        config.validate()?;
        Ok(config)
    }
}
