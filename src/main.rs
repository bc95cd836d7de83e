use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use transcode_bus::{
    Error,
    bus::{Bus, BusEvent},
    pipeline::PipelineStats,
};

mod cli;
mod config;
mod job;

use crate::{
    cli::Cli,
    config::AppConfig,
    job::{JobOutput, build_pipeline},
};

const JOB_ID: &str = "transcode";

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("transcode_bus", level)
        .filter_module("hls_transcode", level)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    #[cfg(feature = "ffmpeg")]
    transcode_bus::ffmpeg::init().context("initialising ffmpeg")?;

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_args(&cli);
    let job = config.into_job()?;
    let pipeline = build_pipeline(&job)?;

    let bus = Bus::new("hls-transcode");
    let mut events = bus.subscribe();
    let handle = bus.spawn(JOB_ID, pipeline).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::warn!("interrupted, cancelling {}", handle.id());
                handle.cancel();
            },
            event = events.next() => match event {
                Some(BusEvent::Segment { entry, .. }) => {
                    log::debug!(
                        "segment {} ready: {:.3}s, {} bytes",
                        entry.index,
                        entry.duration_seconds,
                        entry.byte_length
                    );
                }
                _ => break,
            },
        }
    }

    let stats = match handle.wait().await {
        Ok(stats) => stats,
        Err(Error::Cancelled) => {
            eprintln!("cancelled");
            std::process::exit(130);
        }
        Err(err) => return Err(err).context("transcode failed"),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_summary(&stats, &job.output);
    }
    Ok(())
}

fn print_summary(stats: &PipelineStats, output: &JobOutput) {
    println!(
        "{} frames decoded, {} encoded, {} dropped",
        stats.frames_decoded,
        stats.frames_encoded,
        stats.frames_dropped_transfer + stats.frames_dropped_format
    );
    println!(
        "{} packets ({} bytes) in {} segments",
        stats.packets_written, stats.bytes_written, stats.segments
    );
    if stats.dts_corrections > 0 {
        println!("{} decode timestamps corrected", stats.dts_corrections);
    }
    if let JobOutput::Hls { dir, .. } = output {
        println!(
            "playlist: {}",
            dir.join(transcode_bus::playlist::PLAYLIST_FILE).display()
        );
    }
}
