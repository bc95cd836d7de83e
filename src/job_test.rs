use transcode_bus::{playlist::PLAYLIST_FILE, raw::TestPattern};

use super::*;

fn small_pattern(seconds: f64) -> TestPattern {
    TestPattern {
        width: 8,
        height: 8,
        ..TestPattern::default()
    }
    .with_duration(seconds)
}

fn one_second_segments() -> PipelineConfig {
    PipelineConfig {
        target_segment_duration: 1.0,
        ..PipelineConfig::default()
    }
}

#[test]
fn test_builder_requires_input_and_output() {
    let err = JobConfig::builder().dry_run_output().build().unwrap_err();
    assert!(err.to_string().contains("no input"));

    let err = JobConfig::builder()
        .test_pattern(small_pattern(1.0))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("no output"));
}

#[test]
fn test_builder_input_file() -> anyhow::Result<()> {
    let job = JobConfig::builder()
        .input_file("clip.mp4")
        .hls_output("out", "h264")
        .build()?;

    match &job.input {
        JobInput::File(path) => assert_eq!(path, &PathBuf::from("clip.mp4")),
        other => panic!("expected file input, got {other:?}"),
    }
    assert!(job.hwaccel.is_none());
    Ok(())
}

#[test]
fn test_segment_extension_follows_codec() {
    assert_eq!(segment_extension("rawvideo"), "raw");
    assert_eq!(segment_extension("libx264"), "h264");
    assert_eq!(segment_extension("h264_nvenc"), "h264");
    assert_eq!(segment_extension("hevc_videotoolbox"), "hevc");
    assert_eq!(segment_extension("libx265"), "hevc");
    assert_eq!(segment_extension("mpeg2video"), "ts");
}

#[test]
fn test_test_pattern_to_hls_directory() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = tmp.path().join("hls");
    let job = JobConfig::builder()
        .test_pattern(small_pattern(3.0))
        .hls_output(&dir, "raw")
        .pipeline(one_second_segments())
        .build()?;

    let stats = build_pipeline(&job)?.run()?;
    assert_eq!(stats.segments, 3);
    assert_eq!(stats.frames_encoded, 90);

    let playlist = std::fs::read_to_string(dir.join(PLAYLIST_FILE))?;
    assert!(playlist.starts_with("#EXTM3U"));
    assert!(playlist.contains("segment0.raw"));
    assert!(playlist.contains("segment2.raw"));
    assert!(playlist.trim_end().ends_with("#EXT-X-ENDLIST"));
    for i in 0..3 {
        assert!(dir.join(format!("segment{i}.raw")).is_file());
    }
    Ok(())
}

#[test]
fn test_loopback_device_job() -> anyhow::Result<()> {
    let job = JobConfig::builder()
        .test_pattern(small_pattern(2.0))
        .dry_run_output()
        .pipeline(one_second_segments())
        .hwaccel(Some(HwAccel::Loopback))
        .build()?;

    let pipeline = build_pipeline(&job)?;
    assert_eq!(pipeline.decoder().output_format(), Some(PixelFormat::Opaque));
    let stats = pipeline.run()?;
    assert_eq!(stats.frames_encoded, 60);
    assert_eq!(stats.frames_dropped_transfer, 0);
    assert_eq!(stats.segments, 2);
    Ok(())
}

#[test]
fn test_dry_run_collects_packets() -> anyhow::Result<()> {
    let job = JobConfig::builder()
        .test_pattern(small_pattern(1.0))
        .dry_run_output()
        .build()?;

    let stats = build_pipeline(&job)?.run()?;
    assert_eq!(stats.packets_written, 30);
    assert_eq!(stats.segments, 1);
    Ok(())
}

#[cfg(not(feature = "ffmpeg"))]
#[test]
fn test_file_input_needs_ffmpeg() -> anyhow::Result<()> {
    let job = JobConfig::builder()
        .input_file("clip.mp4")
        .dry_run_output()
        .build()?;
    let err = build_pipeline(&job).err().unwrap();
    assert!(err.to_string().contains("ffmpeg"));
    Ok(())
}
