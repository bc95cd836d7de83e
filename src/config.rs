use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use transcode_bus::{encoder::EncoderSettings, pipeline::PipelineConfig, raw::TestPattern};

use crate::{
    cli::Cli,
    job::{HwAccel, JobConfig, segment_extension},
};

/// Settings for one run: the JSON config file, overridden by flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub input: Option<PathBuf>,
    pub test_pattern: Option<TestPattern>,
    pub output_dir: PathBuf,
    /// Segment file extension. Derived from the codec when unset.
    pub segment_extension: Option<String>,
    pub dry_run: bool,
    pub hwaccel: Option<HwAccel>,
    pub pipeline: PipelineConfig,
    pub encoder: EncoderSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input: None,
            test_pattern: None,
            output_dir: PathBuf::from("hls"),
            segment_extension: None,
            dry_run: false,
            hwaccel: None,
            pipeline: PipelineConfig::default(),
            encoder: EncoderSettings::default(),
        }
    }
}

impl AppConfig {
    /// Reads `path`, or returns the defaults when there is no file.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn apply_args(&mut self, cli: &Cli) {
        if let Some(input) = &cli.input {
            self.input = Some(input.clone());
            self.test_pattern = None;
        }
        if let Some(seconds) = cli.test_pattern {
            let mut pattern = self.test_pattern.take().unwrap_or_default();
            if let Some(fps) = cli.fps {
                pattern.frame_rate = fps;
            }
            self.test_pattern = Some(pattern.with_duration(seconds));
            self.input = None;
        }
        if let Some(dir) = &cli.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(seconds) = cli.segment_duration {
            self.pipeline.target_segment_duration = seconds;
        }
        if let Some(codec) = &cli.codec {
            self.encoder.codec = codec.clone();
        }
        if let Some(fps) = cli.fps {
            self.encoder.frame_rate = fps;
        }
        if let Some(gop) = cli.gop {
            self.encoder.gop_size = gop;
        }
        if let Some(bitrate) = cli.bitrate {
            self.encoder.bit_rate = Some(bitrate);
        }
        if cli.hwaccel.is_some() {
            self.hwaccel = cli.hwaccel;
        }
        self.pipeline.prefer_hw |= cli.prefer_hw;
        self.dry_run |= cli.dry_run;
    }

    pub fn into_job(self) -> anyhow::Result<JobConfig> {
        let extension = self
            .segment_extension
            .unwrap_or_else(|| segment_extension(&self.encoder.codec).to_string());

        let mut builder = JobConfig::builder()
            .pipeline(self.pipeline)
            .encoder(self.encoder)
            .hwaccel(self.hwaccel);
        builder = match (self.input, self.test_pattern) {
            (Some(_), Some(_)) => bail!("config names both an input file and a test pattern"),
            (Some(path), None) => builder.input_file(path),
            (None, Some(pattern)) => builder.test_pattern(pattern),
            (None, None) => builder,
        };
        builder = if self.dry_run {
            builder.dry_run_output()
        } else {
            builder.hls_output(self.output_dir, extension)
        };
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;
    use transcode_bus::Rational;

    use super::*;
    use crate::job::{JobInput, JobOutput};

    #[test]
    fn test_missing_file_gives_defaults() -> anyhow::Result<()> {
        let config = AppConfig::load(None)?;
        assert_eq!(config.output_dir, PathBuf::from("hls"));
        assert_eq!(config.pipeline.target_segment_duration, 2.0);
        assert!(!config.dry_run);
        Ok(())
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"output_dir": "out", "pipeline": {{"target_segment_duration": 4.0}}, "encoder": {{"gop_size": 60}}}}"#
        )?;

        let config = AppConfig::load(Some(file.path()))?;
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.pipeline.target_segment_duration, 4.0);
        assert_eq!(config.pipeline.max_stall_attempts, 64);
        assert_eq!(config.encoder.gop_size, 60);
        assert_eq!(config.encoder.codec, "rawvideo");
        Ok(())
    }

    #[test]
    fn test_unreadable_config_names_the_file() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/hls.json"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/hls.json"));
    }

    #[test]
    fn test_flags_override_file() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "hls-transcode",
            "--test-pattern",
            "3",
            "--fps",
            "25",
            "--gop",
            "50",
            "-d",
            "1.5",
            "-o",
            "segments",
            "--hwaccel",
            "loopback",
        ])?;
        let mut config = AppConfig {
            input: Some(PathBuf::from("from-config.mp4")),
            ..AppConfig::default()
        };
        config.apply_args(&cli);

        assert!(config.input.is_none());
        let pattern = config.test_pattern.as_ref().expect("test pattern");
        assert_eq!(pattern.frames, 75);
        assert_eq!(config.encoder.frame_rate, Rational::from_int(25));
        assert_eq!(config.encoder.gop_size, 50);
        assert_eq!(config.pipeline.target_segment_duration, 1.5);
        assert_eq!(config.hwaccel, Some(HwAccel::Loopback));

        let job = config.into_job()?;
        assert!(matches!(job.input, JobInput::TestPattern(_)));
        match &job.output {
            JobOutput::Hls { dir, extension } => {
                assert_eq!(dir, &PathBuf::from("segments"));
                assert_eq!(extension, "raw");
            }
            other => panic!("expected hls output, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_input_and_test_pattern_conflict() {
        assert!(Cli::try_parse_from(["hls-transcode", "in.mp4", "--test-pattern", "2"]).is_err());
    }

    #[test]
    fn test_job_needs_an_input() {
        assert!(AppConfig::default().into_job().is_err());
    }
}
