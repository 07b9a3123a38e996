use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::media::ConversionProfile;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print events and results as JSON lines instead of a progress bar
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert a media file, reporting progress while it runs
    Convert {
        /// Input media file
        #[arg(short, long)]
        input: PathBuf,

        /// Output media file
        #[arg(short, long)]
        output: PathBuf,

        /// Kill the conversion after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Video codec (overrides configuration)
        #[arg(long)]
        video_codec: Option<String>,

        /// Audio codec (overrides configuration)
        #[arg(long)]
        audio_codec: Option<String>,

        /// Preset profile: high-quality, fast or web-optimized
        #[arg(long)]
        profile: Option<ConversionProfile>,
    },

    /// Show duration and stream information of a media file
    Probe {
        /// Input media file
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Run the media processor with a raw argument string
    Run {
        /// Argument string passed to the binary as-is
        #[arg(short, long, allow_hyphen_values = true)]
        args: String,

        /// Text written to the process's stdin
        #[arg(long)]
        stdin: Option<String>,

        /// Kill the process after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Convert all media files in a directory
    Batch {
        /// Input directory containing media files
        #[arg(short, long)]
        input_dir: PathBuf,

        /// Output directory for converted files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Output container format (file extension)
        #[arg(short, long, default_value = "mp4")]
        format: String,

        /// Kill each conversion after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Locate or unpack the media processor and clean up strays of earlier runs
    Setup,

    /// Write a configuration file with default values
    InitConfig {
        /// Destination path
        #[arg(short, long, default_value = "ffwatch.toml")]
        path: PathBuf,
    },
}
