//! Progress callback interface, replacing the original tool's `QThread` +
//! signal/slot collaborator with a plain trait plus an optional background
//! thread.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, filename: &str, percent: u8);
    fn on_file(&self, filename: &str, index: usize);
    fn on_finished(&self, ok: bool);
}

/// Default sink for callers that don't care about progress.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _filename: &str, _percent: u8) {}
    fn on_file(&self, _filename: &str, _index: usize) {}
    fn on_finished(&self, _ok: bool) {}
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Progress { filename: String, percent: u8 },
    File { filename: String, index: usize },
    Finished { ok: bool },
}

/// A `ProgressSink` that forwards every call across an `mpsc` channel,
/// letting a background thread report back to the thread that spawned it.
pub struct ChannelSink {
    tx: Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        (ChannelSink { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, filename: &str, percent: u8) {
        let _ = self.tx.send(ProgressEvent::Progress {
            filename: filename.to_string(),
            percent,
        });
    }

    fn on_file(&self, filename: &str, index: usize) {
        let _ = self.tx.send(ProgressEvent::File {
            filename: filename.to_string(),
            index,
        });
    }

    fn on_finished(&self, ok: bool) {
        let _ = self.tx.send(ProgressEvent::Finished { ok });
    }
}

/// Runs a unit of work (a build or an install) on its own thread, handing
/// the closure a `ChannelSink` and returning the channel's receiving end
/// plus a handle to join the thread for its final result.
pub struct BackgroundRunner;

impl BackgroundRunner {
    pub fn spawn<F, T>(work: F) -> (Receiver<ProgressEvent>, JoinHandle<T>)
    where
        F: FnOnce(&ChannelSink) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sink, rx) = ChannelSink::new();
        let handle = thread::spawn(move || work(&sink));
        (rx, handle)
    }
}
