//! Classifier capability
//!
//! The engine never interprets image bytes. A classifier receives the
//! opaque photo reference and returns a condition label, a cause and a
//! confidence, or nothing at all.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::schema::ClassifierOutput;

/// An image classifier.
///
/// Implementations should honor their own deadline. `TimedClassifier` stops
/// waiting after its timeout, but an overrunning call keeps its worker
/// thread until it returns; once `MAX_OVERRUNNING_CALLS` are outstanding,
/// further calls fail without being started.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means "no opinion"; the analyzer then uses its heuristic.
    fn classify(&self, photo_ref: &str) -> Result<Option<ClassifierOutput>, String>;
}

/// Never produces output. Selected when no classifier is configured.
#[derive(Debug, Default)]
pub struct NullClassifier;

impl Classifier for NullClassifier {
    fn name(&self) -> &str {
        "none"
    }

    fn classify(&self, _photo_ref: &str) -> Result<Option<ClassifierOutput>, String> {
        Ok(None)
    }
}

/// Runs an external program with the photo reference as its last argument
/// and reads a JSON `ClassifierOutput` from stdout.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

impl CommandClassifier {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl Classifier for CommandClassifier {
    fn name(&self) -> &str {
        &self.program
    }

    fn classify(&self, photo_ref: &str) -> Result<Option<ClassifierOutput>, String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(photo_ref)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.program))?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait().map_err(|e| e.to_string())? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!(
                        "{} timed out after {} ms",
                        self.program,
                        self.timeout.as_millis()
                    ));
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout).map_err(|e| e.to_string())?;
        }
        if !status.success() {
            return Err(format!("{} exited with {status}", self.program));
        }

        let trimmed = stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(None);
        }
        serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| format!("unreadable classifier output: {e}"))
    }
}

pub fn from_config(config: &ClassifierConfig) -> Arc<dyn Classifier> {
    match config {
        ClassifierConfig::None => Arc::new(NullClassifier),
        ClassifierConfig::Command {
            program,
            args,
            timeout,
        } => Arc::new(CommandClassifier::new(program.clone(), args.clone(), *timeout)),
    }
}

/// Calls allowed to keep running past their deadline before new calls are
/// refused.
pub const MAX_OVERRUNNING_CALLS: usize = 2;

/// A classifier invoked on a worker thread with a deadline.
pub struct TimedClassifier {
    inner: Arc<dyn Classifier>,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl TimedClassifier {
    pub fn new(inner: Arc<dyn Classifier>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Worker threads still running a call, including abandoned ones.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn invoke(&self, photo_ref: &str) -> Result<Option<ClassifierOutput>, String> {
        let stranded = self.in_flight();
        if stranded >= MAX_OVERRUNNING_CALLS {
            warn!(classifier = self.name(), stranded, "classifier calls still overrunning");
            return Err(format!(
                "{} has {stranded} calls still running past their deadline",
                self.name()
            ));
        }

        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&self.inner);
        let guard = InFlight::enter(&self.in_flight);
        let photo = photo_ref.to_string();
        thread::spawn(move || {
            let result = worker.classify(&photo);
            drop(guard);
            let _ = tx.send(result);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => {
                debug!(classifier = self.name(), ok = result.is_ok(), "classifier returned");
                result
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(classifier = self.name(), "classifier timed out");
                Err(format!(
                    "{} timed out after {} ms",
                    self.name(),
                    self.timeout.as_millis()
                ))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(format!("{} worker exited without a result", self.name()))
            }
        }
    }
}

/// Counts a running worker until dropped, panics included.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
