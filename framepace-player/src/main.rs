//! # framepace player
//!
//! Headless harness for framepace-core: feeds a synthetic stream through the
//! output session, runs a simulated audio clock alongside it and reports
//! the pacing statistics.

use anyhow::Result;
use framepace_core::config::WindowGeometry;
use framepace_core::geometry::Rational;
use framepace_core::render::HeadlessBackend;
use framepace_core::{
    AudioClock, DecodeStatus, DecodedPicture, DecoderHandle, DisplayScheduler, FrameRate,
    FrameTimestamps, PictureSink, PixelFormat, Pts, SharedAudioClock, StreamFormat, VideoConfig,
    VideoModule, VideoOutput, VideoStream,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 48_000;
const AUDIO_PERIOD: Duration = Duration::from_millis(10);
/// Time allowed for the ring to drain after the stream ends
const DRAIN_TIME: Duration = Duration::from_millis(400);

// ============================================================================
// Options
// ============================================================================

struct PlayerOptions {
    config: Option<PathBuf>,
    frames: u64,
    width: u32,
    height: u32,
    fps: u32,
    interlaced: bool,
    refresh_hz: f64,
    driver: Option<String>,
    geometry: Option<String>,
    audio_delay_ms: Option<i32>,
    trick_speed: u32,
    json: bool,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            config: None,
            frames: 500,
            width: 720,
            height: 576,
            fps: 25,
            interlaced: true,
            refresh_hz: 50.0,
            driver: None,
            geometry: None,
            audio_delay_ms: None,
            trick_speed: 0,
            json: false,
        }
    }
}

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut options = PlayerOptions::default();

    let value = |i: usize, flag: &str| -> Result<String> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Missing value for {}", flag))
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value(i, flag)?));
                i += 2;
            }
            "--frames" | "-n" => {
                let v = value(i, flag)?;
                options.frames = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid frame count {}: {}", v, e))?;
                i += 2;
            }
            "--size" => {
                let v = value(i, flag)?;
                let size = WindowGeometry::parse(&v)?;
                options.width = size.width;
                options.height = size.height;
                i += 2;
            }
            "--fps" => {
                let v = value(i, flag)?;
                options.fps = v.parse().map_err(|e| anyhow::anyhow!("Invalid fps {}: {}", v, e))?;
                i += 2;
            }
            "--progressive" => {
                options.interlaced = false;
                i += 1;
            }
            "--refresh" => {
                let v = value(i, flag)?;
                options.refresh_hz = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid refresh rate {}: {}", v, e))?;
                i += 2;
            }
            "--driver" | "-d" => {
                options.driver = Some(value(i, flag)?);
                i += 2;
            }
            "--geometry" | "-g" => {
                options.geometry = Some(value(i, flag)?);
                i += 2;
            }
            "--audio-delay" => {
                let v = value(i, flag)?;
                options.audio_delay_ms = Some(
                    v.parse()
                        .map_err(|e| anyhow::anyhow!("Invalid audio delay {}: {}", v, e))?,
                );
                i += 2;
            }
            "--trick" => {
                let v = value(i, flag)?;
                options.trick_speed = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid trick speed {}: {}", v, e))?;
                i += 2;
            }
            "--json" => {
                options.json = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    if options.fps == 0 {
        return Err(anyhow::anyhow!("--fps must be positive"));
    }
    Ok(options)
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  framepace [--config <file>] [--frames <n>] [--size <WxH>] [--fps <n>] [--progressive]\n            [--refresh <hz>] [--driver <name>] [--geometry <WxH+X+Y>] [--audio-delay <ms>]\n            [--trick <n>] [--json]\n"
    );
}

// ============================================================================
// Synthetic Stream
// ============================================================================

/// Evenly timed pictures, one per decode step
struct SyntheticStream {
    width: u32,
    height: u32,
    rate: FrameRate,
    first_pts: Pts,
    next: u64,
    total: u64,
    produced: Arc<AtomicU64>,
}

impl SyntheticStream {
    fn frame_ticks(&self) -> i64 {
        90_000 * self.rate.den as i64 / self.rate.num as i64
    }
}

impl VideoStream for SyntheticStream {
    fn decode_input(&mut self, sink: &mut PictureSink<'_>) -> DecodeStatus {
        if self.next >= self.total {
            return DecodeStatus::Empty;
        }
        let pts = self.first_pts + self.next as i64 * self.frame_ticks();
        let mut picture = DecodedPicture::new(self.width, self.height, FrameTimestamps::from_pts(pts));
        picture.frame_rate = Some(self.rate);
        sink.submit(picture);
        self.next += 1;
        self.produced.store(self.next, Ordering::Release);
        DecodeStatus::Decoded
    }

    fn poll_input(&mut self, _sink: &mut PictureSink<'_>) -> DecodeStatus {
        if self.next >= self.total {
            DecodeStatus::Empty
        } else {
            DecodeStatus::Busy
        }
    }
}

// ============================================================================
// Simulated Audio
// ============================================================================

/// Starts audio at the video clock once video is ready, then feeds samples
/// in real time.
fn spawn_audio(
    audio: Arc<SharedAudioClock>,
    output: Arc<VideoOutput>,
    handle: DecoderHandle,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let join = thread::Builder::new().name("framepace-audio".into()).spawn(move || {
        let mut started: Option<Instant> = None;
        let mut reported: u64 = 0;
        while !stop.load(Ordering::Acquire) {
            thread::sleep(AUDIO_PERIOD);
            match started {
                None => {
                    if audio.video_ready_pts().is_none() {
                        continue;
                    }
                    if let Ok(Some(clock)) = output.clock(&handle) {
                        audio.update(Some(clock));
                        audio.set_playing(true);
                        started = Some(Instant::now());
                        tracing::info!("audio started at {}", clock);
                    }
                }
                Some(t) => {
                    let due = (t.elapsed().as_secs_f64() * SAMPLE_RATE as f64) as u64;
                    audio.add_samples(due - reported);
                    reported = due;
                }
            }
        }
        audio.set_playing(false);
    })?;
    Ok(join)
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Serialize)]
struct RunReport {
    module: String,
    frames_requested: u64,
    decoded: u64,
    displayed: u64,
    duped: u64,
    dropped: u64,
    missed: u64,
    frame_processing_us: u128,
    presented: u64,
    wall_ms: u128,
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("framepace=info,framepace_core=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    tracing::info!("framepace v{}", framepace_core::VERSION);

    let mut config = VideoConfig::load_or_default(options.config.as_deref())?;
    if let Some(driver) = &options.driver {
        config.driver = Some(driver.clone());
    }
    if let Some(geometry) = &options.geometry {
        WindowGeometry::parse(geometry)?;
        config.geometry = Some(geometry.clone());
    }
    if let Some(delay) = options.audio_delay_ms {
        config.audio_delay_ms = delay;
    }

    let backend = HeadlessBackend::with_refresh(options.refresh_hz);
    let module = VideoModule::select(config.driver.as_deref(), Some(Box::new(backend)));
    let audio = Arc::new(SharedAudioClock::new(SAMPLE_RATE));
    let audio_dyn: Arc<dyn AudioClock> = audio.clone();
    let output = Arc::new(VideoOutput::new(config, module, audio_dyn));

    let rate = FrameRate::new(options.fps, 1);
    let produced = Arc::new(AtomicU64::new(0));
    let stream = SyntheticStream {
        width: options.width,
        height: options.height,
        rate,
        first_pts: Pts::from_ms(1000),
        next: 0,
        total: options.frames,
        produced: produced.clone(),
    };

    let handle = output.new_decoder(Box::new(stream))?;
    let format = StreamFormat {
        width: options.width,
        height: options.height,
        sample_aspect: Rational::SQUARE,
        interlaced: options.interlaced,
        frame_rate: Some(rate),
    };
    let surfaces = output.negotiate_pixel_format(&handle, &format, &[PixelFormat::Cuda, PixelFormat::Nv12])?;
    tracing::info!(
        "{}x{} {} at {} fps on {:?} surfaces",
        options.width,
        options.height,
        if options.interlaced { "interlaced" } else { "progressive" },
        options.fps,
        surfaces
    );

    if options.trick_speed > 0 {
        output.set_trick_speed(&handle, options.trick_speed)?;
    }

    let started = Instant::now();
    let stop_audio = Arc::new(AtomicBool::new(false));
    let audio_thread = spawn_audio(audio.clone(), output.clone(), handle.clone(), stop_audio.clone())?;
    let mut scheduler = DisplayScheduler::start(output.clone())?;

    // slow playback needs proportionally longer
    let slowdown = options.trick_speed.max(1) as u64;
    let budget = Duration::from_millis(options.frames * 1000 * slowdown / options.fps as u64 + 5000);
    while produced.load(Ordering::Acquire) < options.frames {
        if started.elapsed() > budget {
            tracing::warn!("stream did not finish within {:?}", budget);
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    output.set_closing(&handle)?;
    thread::sleep(DRAIN_TIME);
    scheduler.stop();
    stop_audio.store(true, Ordering::Release);
    if audio_thread.join().is_err() {
        tracing::error!("audio thread panicked");
    }

    let stats = output.stats(&handle)?;
    output.delete_decoder(&handle)?;

    let report = RunReport {
        module: output.module_name(),
        frames_requested: options.frames,
        decoded: stats.decoded,
        displayed: stats.displayed,
        duped: stats.duped,
        dropped: stats.dropped,
        missed: stats.missed,
        frame_processing_us: stats.frame_processing_time.as_micros(),
        presented: scheduler.frames(),
        wall_ms: started.elapsed().as_millis(),
    };

    tracing::info!(
        "done: {} decoded, {} displayed, {} duped, {} dropped, {} missed",
        report.decoded,
        report.displayed,
        report.duped,
        report.dropped,
        report.missed
    );

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("framepace")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let options = parse_args(&args(&[
            "--frames", "100", "--size", "1920x1080", "--progressive", "--trick", "2", "--json",
        ]))
        .unwrap();
        assert_eq!(options.frames, 100);
        assert_eq!((options.width, options.height), (1920, 1080));
        assert!(!options.interlaced);
        assert_eq!(options.trick_speed, 2);
        assert!(options.json);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&args(&["--frames"])).is_err());
        assert!(parse_args(&args(&["--frames", "many"])).is_err());
        assert!(parse_args(&args(&["--fps", "0"])).is_err());
    }
}
