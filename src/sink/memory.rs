use super::{FrameSink, SinkFactory, SinkSpec};
use crate::frame::Frame;
use crate::utils::lock;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    frames: Vec<Frame>,
    written: usize,
    released: bool,
}

/// In-memory sink. Clones share the same storage, so one clone can be handed
/// to a writer thread while another is inspected.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<State>>,
    keep_frames: bool,
    write_delay: Duration,
}

impl MemorySink {
    /// Keeps every written frame.
    pub fn new() -> Self {
        Self {
            keep_frames: true,
            ..Default::default()
        }
    }

    /// Only counts frames; for dry runs of long recordings.
    pub fn counting() -> Self {
        Self::default()
    }

    /// Simulates a slow encoder.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn frames(&self) -> Vec<Frame> {
        lock(&self.state).frames.clone()
    }

    pub fn written(&self) -> usize {
        lock(&self.state).written
    }

    pub fn is_released(&self) -> bool {
        lock(&self.state).released
    }
}

impl FrameSink for MemorySink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if !self.write_delay.is_zero() {
            thread::sleep(self.write_delay);
        }
        let mut state = lock(&self.state);
        if state.released {
            return Err(anyhow!("Sink already released"));
        }
        state.written += 1;
        if self.keep_frames {
            state.frames.push(frame.clone());
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        lock(&self.state).released = true;
        Ok(())
    }
}

/// Hands out counting [`MemorySink`]s and keeps a clone of each for
/// inspection.
#[derive(Debug, Clone, Default)]
pub struct MemorySinks {
    sinks: BTreeMap<usize, MemorySink>,
    touch_files: bool,
}

impl MemorySinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also creates an empty file at each sink's path, standing in for the
    /// video.
    pub fn touching_files(mut self) -> Self {
        self.touch_files = true;
        self
    }

    pub fn sink(&self, camera_id: usize) -> Option<&MemorySink> {
        self.sinks.get(&camera_id)
    }
}

impl SinkFactory for MemorySinks {
    fn create(&mut self, spec: &SinkSpec<'_>) -> Result<Box<dyn FrameSink>> {
        if self.touch_files {
            if let Some(dir) = spec.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
            }
            fs::write(spec.path, b"").with_context(|| format!("Failed to create {:?}", spec.path))?;
        }
        let sink = MemorySink::counting();
        self.sinks.insert(spec.camera_id, sink.clone());
        Ok(Box::new(sink))
    }
}
