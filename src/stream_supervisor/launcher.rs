//! Transcoder command construction and progress parsing

use super::types::OutputLayout;
use crate::quality_tier::Tier;
use crate::source_registry::Source;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Everything a launcher needs to build one transcoder invocation
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub source: &'a Source,
    pub tier: Tier,
    pub layout: &'a OutputLayout,
    pub segment_seconds: u32,
    pub segment_window: u32,
}

/// Builds the external transcoder command.
///
/// The supervisor owns stdio wiring, `kill_on_drop` and signalling; a launcher
/// only decides program and arguments. Progress is expected on stdout as
/// `key=value` lines, diagnostics on stderr.
pub trait TranscoderLauncher: Send + Sync {
    fn command(&self, request: &LaunchRequest<'_>) -> Command;
}

/// ffmpeg HLS launcher
pub struct FfmpegLauncher {
    bin: PathBuf,
}

impl FfmpegLauncher {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    pub(crate) fn args(request: &LaunchRequest<'_>) -> Vec<String> {
        let spec = request.tier.spec();
        let gop = (spec.fps * request.segment_seconds.max(1)).to_string();
        let bitrate = format!("{}k", spec.bitrate_kbps);
        let bufsize = format!("{}k", spec.bitrate_kbps * 2);

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostats".into(),
            "-progress".into(),
            "pipe:1".into(),
        ];

        if request.source.is_rtsp() {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend(["-i".into(), request.source.uri.clone()]);

        args.extend([
            "-vf".into(),
            format!("scale={}:{}", spec.width, spec.height),
            "-r".into(),
            spec.fps.to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-b:v".into(),
            bitrate.clone(),
            "-maxrate".into(),
            bitrate,
            "-bufsize".into(),
            bufsize,
            "-g".into(),
            gop.clone(),
            "-keyint_min".into(),
            gop,
            "-sc_threshold".into(),
            "0".into(),
        ]);

        if request.source.audio {
            args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "64k".into()]);
        } else {
            args.push("-an".into());
        }

        args.extend([
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            request.segment_seconds.to_string(),
            "-hls_list_size".into(),
            request.segment_window.to_string(),
            "-hls_flags".into(),
            "delete_segments+append_list+omit_endlist".into(),
            "-hls_segment_filename".into(),
            request.layout.segment_pattern.display().to_string(),
            request.layout.manifest.display().to_string(),
        ]);

        args
    }
}

impl TranscoderLauncher for FfmpegLauncher {
    fn command(&self, request: &LaunchRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(Self::args(request)).stdin(Stdio::null());
        cmd
    }
}

/// One parsed line of transcoder progress output
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    Frame(u64),
    Fps(f32),
    /// Any other progress key (out_time, bitrate, progress=continue)
    Tick,
    /// `progress=end`
    End,
}

/// Parse one `key=value` progress line. Non-progress output yields None.
pub fn parse_progress(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    let value = value.trim();
    match key.trim() {
        "frame" => value.parse().ok().map(ProgressLine::Frame),
        "fps" => value.parse().ok().map(ProgressLine::Fps),
        "progress" if value == "end" => Some(ProgressLine::End),
        "progress" | "out_time_ms" | "out_time_us" | "out_time" | "total_size" | "bitrate" => {
            Some(ProgressLine::Tick)
        }
        _ => None,
    }
}
