//! Shared helpers for unit tests.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};

use crate::event::EventEmitter;

/// In-memory sink for the event stream.
#[derive(Clone, Default)]
pub struct CapturedEvents {
    buffer: Arc<Mutex<Vec<u8>>>,
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CapturedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitter(&self) -> EventEmitter {
        EventEmitter::new(CaptureWriter(self.buffer.clone()))
    }

    /// Parses every emitted line; panics on a partial or malformed record.
    pub fn events(&self) -> Vec<serde_json::Value> {
        let buffer = self.buffer.lock().unwrap();
        std::str::from_utf8(&buffer)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    pub fn events_of(&self, kind: &str) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter(|event| event["type"] == kind)
            .collect()
    }
}
