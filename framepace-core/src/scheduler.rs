//! Display scheduler thread
//!
//! Loops [`VideoOutput::display_pass`] until stopped. Pacing comes from the
//! backend's vsync wait inside each pass.

use crate::output::{PassOutcome, VideoOutput};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct DisplayScheduler {
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl DisplayScheduler {
    pub fn start(output: Arc<VideoOutput>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let handle = thread::Builder::new().name("framepace-display".into()).spawn({
            let stop = stop.clone();
            let frames = frames.clone();
            move || {
                tracing::debug!("display thread started");
                while !stop.load(Ordering::Acquire) {
                    if output.display_pass() == PassOutcome::Displayed {
                        frames.fetch_add(1, Ordering::Relaxed);
                    }
                }
                tracing::debug!("display thread stopped");
            }
        })?;
        Ok(Self {
            stop,
            frames,
            handle: Some(handle),
        })
    }

    /// Frames presented so far
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("display thread panicked");
            }
        }
    }
}

impl Drop for DisplayScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoConfig;
    use crate::render::{HeadlessBackend, VideoModule};
    use crate::sync::SharedAudioClock;
    use std::time::Duration;

    #[test]
    fn test_start_stop() {
        let module = VideoModule::select(None, Some(Box::new(HeadlessBackend::with_refresh(500.0))));
        let output = Arc::new(VideoOutput::new(
            VideoConfig::default(),
            module,
            Arc::new(SharedAudioClock::new(48_000)),
        ));
        let mut scheduler = DisplayScheduler::start(output).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(scheduler.is_running());
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert!(scheduler.frames() > 0);
    }
}
