use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use powerclimate_common::{StoreError, TimerRecord, TimerRecords, TimerStore};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Timer store backed by a JSON file. The engine talks to it synchronously;
/// writes are handed to a background task so a slow disk never stalls a tick.
/// The task reports the outcome of its last write back through `write_error`.
pub struct JsonTimerStore {
    records: TimerRecords,
    load_error: Option<StoreError>,
    writes: mpsc::UnboundedSender<TimerRecords>,
    write_error: watch::Receiver<Option<String>>,
}

impl JsonTimerStore {
    pub async fn open(path: PathBuf) -> Self {
        let (records, load_error) = match read_records(&path).await {
            Ok(records) => (records, None),
            Err(err) => (TimerRecords::new(), Some(err)),
        };
        let (writes, pending) = mpsc::unbounded_channel();
        let (status, write_error) = watch::channel(None);
        tokio::spawn(write_loop(path, pending, status));

        Self {
            records,
            load_error,
            writes,
            write_error,
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.writes
            .send(self.records.clone())
            .map_err(|_| StoreError::Unavailable("timer writer task stopped".to_string()))
    }
}

impl TimerStore for JsonTimerStore {
    fn load(&mut self) -> Result<TimerRecords, StoreError> {
        match self.load_error.take() {
            Some(err) => Err(err),
            None => Ok(self.records.clone()),
        }
    }

    fn save(&mut self, device_id: &str, record: &TimerRecord) -> Result<(), StoreError> {
        self.records.insert(device_id.to_string(), *record);
        self.flush()?;
        self.health()
    }

    fn remove(&mut self, device_id: &str) -> Result<(), StoreError> {
        if self.records.remove(device_id).is_some() {
            self.flush()?;
        }
        self.health()
    }

    fn health(&self) -> Result<(), StoreError> {
        match self.write_error.borrow().as_ref() {
            Some(message) => Err(StoreError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }
}

async fn read_records(path: &Path) -> Result<TimerRecords, StoreError> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt(err.to_string())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(TimerRecords::new()),
        Err(err) => Err(err.into()),
    }
}

async fn write_loop(
    path: PathBuf,
    mut pending: mpsc::UnboundedReceiver<TimerRecords>,
    status: watch::Sender<Option<String>>,
) {
    while let Some(mut records) = pending.recv().await {
        // Each message is a full snapshot; only the newest one matters.
        while let Ok(newer) = pending.try_recv() {
            records = newer;
        }
        let was_failing = status.borrow().is_some();
        match write_records(&path, &records).await {
            Ok(()) => {
                if was_failing {
                    info!(path = %path.display(), "timer store writable again");
                }
                debug!(devices = records.len(), "timer store written");
                status.send_replace(None);
            }
            Err(err) => {
                let message = format!("failed to write {}: {err:#}", path.display());
                if was_failing {
                    debug!("{message}");
                } else {
                    warn!("{message}");
                }
                status.send_replace(Some(message));
            }
        }
    }
}

async fn write_records(path: &Path, records: &TimerRecords) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_vec_pretty(records)?;
    tokio::fs::write(path, payload).await?;
    Ok(())
}
