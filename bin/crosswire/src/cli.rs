use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use crosswire_deploy::{DEFAULT_DESCRIPTOR, RunOptions};
use tracing::level_filters::LevelFilter;

/// Which configuration batches of a pair to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Direction {
    /// Outbound security stack and executor limits.
    Send,
    /// Inbound security stack.
    Receive,
    All,
}

impl Direction {
    pub fn includes_send(self) -> bool {
        matches!(self, Self::Send | Self::All)
    }

    pub fn includes_receive(self) -> bool {
        matches!(self, Self::Receive | Self::All)
    }
}

#[derive(Parser)]
#[command(name = "crosswire")]
#[command(
    author,
    version,
    about = "Deploy contract graphs across chains and wire their messaging path"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "CROSSWIRE_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the deployment descriptor.
    ///
    /// Nested values can be overridden from the environment, e.g.
    /// `CROSSWIRE_CHAINS__MAINNET__SIGNING_KEY`.
    #[arg(short, long, global = true, alias = "conf", env = "CROSSWIRE_CONFIG", default_value = DEFAULT_DESCRIPTOR)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy every chain's step graph.
    Deploy(RunArgs),
    /// Configure the messaging path of every chain pair, using checkpointed registries.
    Wire(RunArgs),
    /// Deploy, then wire.
    Run(RunArgs),
    /// Print the execution order of each chain without sending transactions.
    Plan {
        /// Target environment.
        #[arg(env = "CROSSWIRE_ENVIRONMENT")]
        environment: String,

        /// Run the whole pipeline against in-memory ledgers instead.
        #[arg(long)]
        simulate: bool,
    },
    /// Print the encoded messaging configuration of one chain pair.
    Encode {
        /// Target environment.
        #[arg(env = "CROSSWIRE_ENVIRONMENT")]
        environment: String,

        /// Local chain of the pair.
        local: String,

        /// Remote chain of the pair.
        remote: String,

        #[arg(long, default_value_t = Direction::All)]
        direction: Direction,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Target environment.
    #[arg(env = "CROSSWIRE_ENVIRONMENT")]
    pub environment: String,

    /// Reuse the registry checkpoint of a previous run.
    ///
    /// Components already recorded there are not deployed again.
    #[arg(long, env = "CROSSWIRE_RESUME")]
    pub resume: bool,

    /// Submit deployed contracts for source verification.
    #[arg(long, env = "CROSSWIRE_VERIFY")]
    pub verify: bool,

    /// Seconds to wait for each transaction to be mined.
    #[arg(long, env = "CROSSWIRE_CONFIRMATION_TIMEOUT")]
    pub confirmation_timeout: Option<u64>,

    /// Retries of a transaction after transient failures.
    #[arg(long, env = "CROSSWIRE_MAX_RETRY_ATTEMPTS")]
    pub max_retry_attempts: Option<usize>,

    /// Independent steps executing at once on one chain.
    #[arg(long, env = "CROSSWIRE_MAX_IN_FLIGHT")]
    pub max_in_flight: Option<usize>,

    /// Gas limit as a percentage of the node's estimate.
    #[arg(long, env = "CROSSWIRE_GAS_MULTIPLIER")]
    pub gas_multiplier: Option<u64>,

    /// Print the final report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Command-line values take precedence over the descriptor's `[options]`.
    pub fn apply(&self, options: &mut RunOptions) {
        options.resume |= self.resume;
        options.verify |= self.verify;
        if let Some(timeout) = self.confirmation_timeout {
            options.confirmation_timeout = timeout;
        }
        if let Some(attempts) = self.max_retry_attempts {
            options.max_retry_attempts = attempts;
        }
        if let Some(max_in_flight) = self.max_in_flight {
            options.max_in_flight = max_in_flight;
        }
        if let Some(multiplier) = self.gas_multiplier {
            options.gas_multiplier = multiplier;
        }
    }
}
