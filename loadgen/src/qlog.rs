use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Append-only qlog sink. One file per `(worker_id, client_id)`; chunks the
/// state machine emits are written verbatim. Cloneable so the state machine
/// can hold a writer handle while the engine owns teardown.
#[derive(Clone)]
pub struct QlogSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl QlogSink {
    pub fn open(base: &str, worker_id: usize, client_id: usize) -> io::Result<Self> {
        let path = PathBuf::from(format!("{base}.{worker_id}.{client_id}.sqlog"));
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn append(&self, data: &[u8]) {
        let mut file = self.file.lock().expect("qlog file lock");
        if let Err(err) = file.write_all(data) {
            warn!(path = %self.path.display(), error = %err, "qlog write failed");
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}
