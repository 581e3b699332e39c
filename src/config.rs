//! Command-line and environment configuration.

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleConfig;
use crate::ports::PortRange;
use crate::runtime::ContainerTemplate;
use crate::state::Auth;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "ephemera")]
#[command(about = "Ephemeral browser-sandbox containers with HTTP API")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Print the records in the container store and exit
    Status {
        /// SQLite database holding container records
        #[arg(long, env = "EPHEMERA_DB", default_value = "containers.db")]
        db_path: PathBuf,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Memory,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "EPHEMERA_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Shared secret expected as `Authorization: Bearer <secret>`
    #[arg(long, env = "AUTH_SECRET", hide_env_values = true)]
    pub auth_secret: Option<String>,

    /// Skip authorization entirely (development only)
    #[arg(long, env = "DEV_MODE")]
    pub insecure: bool,

    /// SQLite database holding container records
    #[arg(long, env = "EPHEMERA_DB", default_value = "containers.db")]
    pub db_path: PathBuf,

    /// Container runtime backend
    #[arg(long, value_enum, default_value = "docker")]
    pub runtime: RuntimeKind,

    /// Docker daemon socket
    #[arg(long, env = "DOCKER_HOST")]
    pub docker_host: Option<String>,

    /// Image to run in each container
    #[arg(long, default_value = "linuxserver/chromium:latest")]
    pub image: String,

    /// Container-side ports, mapped in order to the allocated host ports
    #[arg(long = "container-port", default_values_t = [3000u16, 3001u16])]
    pub container_ports: Vec<u16>,

    /// Environment passed to each container (KEY=VALUE)
    #[arg(
        long = "env",
        default_values_t = [
            "PUID=1000".to_string(),
            "PGID=1000".to_string(),
            "TZ=Etc/UTC".to_string(),
            "CHROME_CLI=chrome://newtab".to_string(),
        ]
    )]
    pub container_env: Vec<String>,

    /// Shared memory size for each container in MiB
    #[arg(long, default_value = "512")]
    pub shm_size_mb: u64,

    /// DNS servers for each container
    #[arg(long)]
    pub dns: Vec<String>,

    /// Security options for each container
    #[arg(long, default_values_t = ["seccomp=unconfined".to_string()])]
    pub security_opt: Vec<String>,

    /// Bind mounts for each container (host:container[:mode])
    #[arg(long = "bind")]
    pub binds: Vec<String>,

    /// TTL applied when a request does not specify one
    #[arg(long, default_value = "14400")]
    pub default_ttl_secs: u64,

    /// Largest TTL a request may ask for
    #[arg(long, default_value = "604800")]
    pub max_ttl_secs: u64,

    /// Host ports per container when a request does not specify a count
    #[arg(long, default_value = "2")]
    pub default_port_count: usize,

    #[arg(long, default_value = "1024")]
    pub port_range_start: u16,

    #[arg(long, default_value = "65535")]
    pub port_range_end: u16,

    /// Candidate ports probed before allocation gives up
    #[arg(long, default_value = "512")]
    pub max_probe_attempts: usize,

    /// Deadline for each runtime call
    #[arg(long, default_value = "30")]
    pub runtime_timeout_secs: u64,

    /// Teardown attempts when a container expires
    #[arg(long, default_value = "5")]
    pub expiry_retries: u32,

    /// Initial backoff between expiry attempts, doubled each retry
    #[arg(long, default_value = "1000")]
    pub expiry_backoff_ms: u64,

    /// Interval of the stuck-record sweeper
    #[arg(long, default_value = "60")]
    pub sweep_interval_secs: u64,
}

impl ServeArgs {
    pub fn port_range(&self) -> Result<PortRange> {
        PortRange::new(self.port_range_start, self.port_range_end)
    }

    pub fn template(&self) -> Result<ContainerTemplate> {
        if self.container_ports.is_empty() {
            return Err(Error::Validation(
                "at least one --container-port is required".into(),
            ));
        }
        if let Some(bad) = self.container_env.iter().find(|e| !e.contains('=')) {
            return Err(Error::Validation(format!(
                "--env '{}' is not KEY=VALUE",
                bad
            )));
        }
        Ok(ContainerTemplate {
            image: self.image.clone(),
            container_ports: self.container_ports.clone(),
            env: self.container_env.clone(),
            shm_size_mb: Some(self.shm_size_mb).filter(|mb| *mb > 0),
            dns: self.dns.clone(),
            security_opt: self.security_opt.clone(),
            binds: self.binds.clone(),
            ..ContainerTemplate::default()
        })
    }

    pub fn lifecycle_config(&self) -> Result<LifecycleConfig> {
        let config = LifecycleConfig {
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            max_ttl: Duration::from_secs(self.max_ttl_secs),
            default_port_count: self.default_port_count,
            runtime_timeout: Duration::from_secs(self.runtime_timeout_secs.max(1)),
            expiry_retries: self.expiry_retries.max(1),
            expiry_backoff: Duration::from_millis(self.expiry_backoff_ms),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        };
        if config.default_ttl.is_zero() || config.default_ttl > config.max_ttl {
            return Err(Error::Validation(
                "--default-ttl-secs must be positive and within --max-ttl-secs".into(),
            ));
        }
        if config.default_port_count == 0 || config.default_port_count > self.container_ports.len()
        {
            return Err(Error::Validation(format!(
                "--default-port-count must be between 1 and {}",
                self.container_ports.len()
            )));
        }
        Ok(config)
    }

    /// Resolve the auth policy, generating a secret if none was configured.
    pub fn auth(&self) -> Auth {
        if self.insecure {
            warn!("Authorization disabled (insecure mode)");
            return Auth::Insecure;
        }
        let configured = self
            .auth_secret
            .clone()
            .or_else(|| std::env::var("API_KEY").ok())
            .filter(|s| !s.trim().is_empty());
        match configured {
            Some(secret) => Auth::bearer(secret),
            None => {
                let secret = generate_secret();
                warn!(secret = %secret, "No auth secret configured, generated one");
                Auth::bearer(secret)
            }
        }
    }
}

fn generate_secret() -> String {
    let bytes: [u8; 24] = rand::rng().random();
    hex::encode(bytes)
}
