use anyhow::bail;
use braid::OrchestratorConfig;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `braid-server` binary.
///
/// These settings control request limits, buffering, and the built-in
/// development engine. All values are parsed from CLI arguments or
/// environment variables (a `.env` file is loaded first), with defaults
/// suitable for local use.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "braid-server",
    version,
    about = "An HTTP service streaming n parallel text completions"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:5000"))]
    pub server_addr: String,

    /// Maximum number of completions (`n`) a single request may ask for.
    ///
    /// Every completion runs as its own worker, so this bounds the fan-out of
    /// one request.
    ///
    /// Environment variable: `MAX_CHOICES`
    #[arg(long, env = "MAX_CHOICES", default_value_t = 16)]
    pub max_choices: usize,

    /// Capacity of the event buffer between the aggregator and the HTTP
    /// response body.
    ///
    /// Lower values apply backpressure sooner when a client reads slowly.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 16)]
    pub stream_buffer_size: usize,

    /// How often, in milliseconds, streaming requests check whether the client
    /// is still connected.
    ///
    /// Environment variable: `DISCONNECT_POLL_MS`
    #[arg(long, env = "DISCONNECT_POLL_MS", default_value_t = 500)]
    pub disconnect_poll_ms: u64,

    /// Seconds to wait for in-flight requests to finish on shutdown before
    /// cancelling them.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Model name reported in responses.
    ///
    /// Environment variable: `MODEL_NAME`
    #[arg(long, env = "MODEL_NAME", default_value_t = String::from("echo"))]
    pub model_name: String,

    /// Artificial per-token latency of the built-in echo engine, in
    /// milliseconds.
    ///
    /// Environment variable: `TOKEN_DELAY_MS`
    #[arg(long, env = "TOKEN_DELAY_MS", default_value_t = 20)]
    pub token_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub max_choices: usize,
    pub stream_buffer_size: usize,
    pub disconnect_poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub model_name: String,
    pub token_delay: Duration,
}

impl ServerConfig {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            disconnect_poll_interval: self.disconnect_poll_interval,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_choices == 0 {
            bail!("MAX_CHOICES must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.disconnect_poll_ms == 0 {
            bail!("DISCONNECT_POLL_MS must be greater than 0");
        }

        if args.model_name.trim().is_empty() {
            bail!("MODEL_NAME must not be empty");
        }

        Ok(Self {
            server_addr: args.server_addr,
            max_choices: args.max_choices,
            stream_buffer_size: args.stream_buffer_size,
            disconnect_poll_interval: Duration::from_millis(args.disconnect_poll_ms),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            model_name: args.model_name,
            token_delay: Duration::from_millis(args.token_delay_ms),
        })
    }
}
