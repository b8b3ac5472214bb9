use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};

macro_rules! arg_env {
    ($v:literal) => {
        concat!("FETCHMUX_", $v)
    };
}

/// Fetch web videos through an extraction tool and hand them over as they come,
/// merging separate video and audio streams when needed.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    /// The path to a TOML configuration file.
    /// Values are overridden by the `FETCHMUX_*` environment variables
    #[arg(long, short, global = true, env = arg_env!("CONFIG"))]
    pub config: Option<PathBuf>,

    /// The most verbose log level to print
    #[arg(long, global = true, default_value_t = tracing::Level::INFO, env = arg_env!("LOG_LEVEL"))]
    pub log_level: tracing::Level,

    /// The directory holding intermediate and merged files
    #[arg(long, global = true, env = arg_env!("SCRATCH_DIR"))]
    pub scratch_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API
    Serve {
        /// The address to listen on
        #[arg(long, env = arg_env!("LISTEN"))]
        listen: Option<SocketAddr>,
    },

    /// Print the stream variants of a video as JSON
    Formats {
        /// The page of the video
        url: String,
    },

    /// Fetch one variant of a video to a local file
    Fetch {
        /// The page of the video
        url: String,

        /// The format id of the video variant
        #[arg(long)]
        video: String,

        /// The format id of the audio variant to merge with the video
        #[arg(long)]
        audio: Option<String>,

        /// The video variant has no audio track: merge it with the best audio
        #[arg(long)]
        merge: bool,

        /// The title used in logs
        #[arg(long)]
        title: Option<String>,

        /// The file to write
        #[arg(long, short)]
        output: PathBuf,
    },

    /// Delete the stale files of the scratch directory
    Sweep {
        /// Age in seconds past which a file is stale.
        /// Defaults to the configured retention
        #[arg(long)]
        max_age: Option<u64>,
    },
}
