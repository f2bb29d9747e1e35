use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::daemon::ProbeArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the inference proxy and the GPU arbiter
    Daemon(Box<DaemonArgs>),
    /// Print the unit state and the classified GPU processes, then exit
    Probe(ProbeArgs),
}
