use std::path::PathBuf;

use clap::Parser;
use transcode_bus::Rational;

use crate::job::HwAccel;

#[derive(Parser, Debug)]
#[command(name = "hls-transcode")]
#[command(author, version, about = "Transcode a video stream into keyframe-aligned HLS segments")]
pub struct Cli {
    /// Input file (needs the ffmpeg feature)
    pub input: Option<PathBuf>,

    /// Directory receiving the segments and playlist.m3u8
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Minimum segment length in seconds
    #[arg(short = 'd', long)]
    pub segment_duration: Option<f64>,

    /// Path to a JSON config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Encoder name, e.g. rawvideo or h264
    #[arg(long)]
    pub codec: Option<String>,

    /// Output frame rate, `30` or `30000/1001`
    #[arg(long)]
    pub fps: Option<Rational>,

    /// Frames between keyframes
    #[arg(long)]
    pub gop: Option<u32>,

    /// Target bit rate in bits per second
    #[arg(long)]
    pub bitrate: Option<u64>,

    /// Decode through a hardware device
    #[arg(long, value_enum)]
    pub hwaccel: Option<HwAccel>,

    /// Use a synthetic input of this many seconds instead of a file
    #[arg(long, value_name = "SECONDS", conflicts_with = "input")]
    pub test_pattern: Option<f64>,

    /// Try hardware encoders before software ones
    #[arg(long)]
    pub prefer_hw: bool,

    /// Run the pipeline without writing any files
    #[arg(long)]
    pub dry_run: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
