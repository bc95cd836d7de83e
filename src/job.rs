use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use transcode_bus::{
    codec::{CodecRegistry, DecodeStep},
    decoder::DecoderOptions,
    encoder::EncoderSettings,
    format::PixelFormat,
    input::Demuxer,
    output::{HlsDirectory, MemoryMuxer},
    pipeline::{Pipeline, PipelineConfig},
    raw::{LoopbackDevice, TestPattern, TestPatternSource},
    stream::MediaType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    /// In-process device that keeps frames in a slot pool
    Loopback,
}

#[derive(Debug, Clone)]
pub enum JobInput {
    File(PathBuf),
    TestPattern(TestPattern),
}

#[derive(Debug, Clone)]
pub enum JobOutput {
    Hls { dir: PathBuf, extension: String },
    /// Packets are collected in memory and dropped.
    DryRun,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub input: JobInput,
    pub output: JobOutput,
    pub pipeline: PipelineConfig,
    pub encoder: EncoderSettings,
    pub hwaccel: Option<HwAccel>,
}

impl JobConfig {
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct JobConfigBuilder {
    input: Option<JobInput>,
    output: Option<JobOutput>,
    pipeline: PipelineConfig,
    encoder: EncoderSettings,
    hwaccel: Option<HwAccel>,
}

impl JobConfigBuilder {
    /// Read from a media file
    pub fn input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.input = Some(JobInput::File(path.into()));
        self
    }

    /// Read from the synthetic source
    pub fn test_pattern(mut self, pattern: TestPattern) -> Self {
        self.input = Some(JobInput::TestPattern(pattern));
        self
    }

    pub fn hls_output(mut self, dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        self.output = Some(JobOutput::Hls {
            dir: dir.into(),
            extension: extension.into(),
        });
        self
    }

    pub fn dry_run_output(mut self) -> Self {
        self.output = Some(JobOutput::DryRun);
        self
    }

    pub fn pipeline(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    pub fn encoder(mut self, settings: EncoderSettings) -> Self {
        self.encoder = settings;
        self
    }

    pub fn hwaccel(mut self, hwaccel: Option<HwAccel>) -> Self {
        self.hwaccel = hwaccel;
        self
    }

    pub fn build(self) -> anyhow::Result<JobConfig> {
        Ok(JobConfig {
            input: self
                .input
                .ok_or_else(|| anyhow!("no input: pass a file or --test-pattern SECONDS"))?,
            output: self.output.ok_or_else(|| anyhow!("no output configured"))?,
            pipeline: self.pipeline,
            encoder: self.encoder,
            hwaccel: self.hwaccel,
        })
    }
}

/// File extension for segments holding `codec` payloads.
pub fn segment_extension(codec: &str) -> &'static str {
    if codec == "rawvideo" {
        "raw"
    } else if codec.contains("264") {
        "h264"
    } else if codec.contains("265") || codec.contains("hevc") {
        "hevc"
    } else {
        "ts"
    }
}

/// Wires the job's input, codecs and output into a pipeline ready to run.
pub fn build_pipeline(job: &JobConfig) -> anyhow::Result<Pipeline> {
    let mut pipeline_config = job.pipeline.clone();
    let (input, decoder) = match &job.input {
        JobInput::TestPattern(pattern) => {
            let source = TestPatternSource::new(pattern.clone()).context("test pattern")?;
            (Box::new(source) as Box<dyn Demuxer>, None)
        }
        JobInput::File(path) => {
            let (input, decoder, index) = open_file(path, pipeline_config.stream_index)?;
            pipeline_config.stream_index = Some(index);
            (input, Some(decoder))
        }
    };

    #[allow(unused_mut)]
    let mut registry = CodecRegistry::with_builtin();
    #[cfg(feature = "ffmpeg")]
    transcode_bus::ffmpeg::register(&mut registry);

    let mut decoder_options = DecoderOptions::default();
    if let Some(HwAccel::Loopback) = job.hwaccel {
        let stream = match pipeline_config.stream_index {
            Some(index) => input.stream(index),
            None => input.best_stream(MediaType::Video),
        };
        let format = stream
            .and_then(|s| s.format())
            .and_then(|f| f.pixel())
            .unwrap_or(PixelFormat::Yuv420p);
        log::info!("decoding through loopback device ({})", format);
        decoder_options = decoder_options.with_hw_device(LoopbackDevice::new(format).into_device());
    }

    let target_seconds = pipeline_config.target_segment_duration;
    let mut builder = Pipeline::builder(input)
        .config(pipeline_config)
        .registry(registry)
        .decoder_options(decoder_options)
        .encoder_settings(job.encoder.clone());
    if let Some(decoder) = decoder {
        builder = builder.decoder(decoder);
    }
    builder = match &job.output {
        JobOutput::Hls { dir, extension } => {
            let hls = HlsDirectory::create(dir, target_seconds)
                .with_context(|| format!("creating {}", dir.display()))?
                .with_extension(extension.clone());
            builder.segment_consumer(Box::new(hls))
        }
        JobOutput::DryRun => builder.muxer(Box::new(MemoryMuxer::new())),
    };
    Ok(builder.build()?)
}

#[cfg(feature = "ffmpeg")]
fn open_file(
    path: &Path,
    stream_index: Option<usize>,
) -> anyhow::Result<(Box<dyn Demuxer>, Box<dyn DecodeStep>, usize)> {
    use transcode_bus::ffmpeg::FfmpegInput;

    let input = FfmpegInput::open(path).with_context(|| format!("opening {}", path.display()))?;
    let index = match stream_index {
        Some(index) => index,
        None => input
            .best_stream(MediaType::Video)
            .map(|s| s.index())
            .ok_or_else(|| anyhow!("{} has no video stream", path.display()))?,
    };
    let decoder = input.decoder(index)?;
    Ok((Box::new(input), Box::new(decoder), index))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_file(
    path: &Path,
    _stream_index: Option<usize>,
) -> anyhow::Result<(Box<dyn Demuxer>, Box<dyn DecodeStep>, usize)> {
    Err(anyhow!(
        "cannot read {}: built without the ffmpeg feature, use --test-pattern",
        path.display()
    ))
}

#[cfg(test)]
#[path = "job_test.rs"]
mod job_test;
