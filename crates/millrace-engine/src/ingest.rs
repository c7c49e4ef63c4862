//! Resource ingestion: the consumer side of the emission channel.
//!
//! One ingester runs per scheduler batch on a dedicated thread. Each
//! emission is hashed, written through to the object store when novel,
//! and upserted as a resource row. Every operation is idempotent, so
//! parallel producers and crash/retry cycles converge on the same rows.

use std::sync::Arc;

use millrace_state::{sha256_hex, MetaStore, ObjectStore, StateError};
use millrace_types::{logical_name, FileEmission};
use tokio::sync::mpsc;

use crate::errors::PipelineError;

/// Turn one captured output file into a durable resource.
///
/// # Errors
///
/// Returns [`StateError`] on object or metadata store failure.
pub fn ingest_emission(
    objects: &ObjectStore,
    meta: &dyn MetaStore,
    emission: &FileEmission,
) -> Result<i64, StateError> {
    let hash = sha256_hex(&emission.payload);
    let name = logical_name(&emission.name);
    if !objects.exists(&hash) {
        objects.put(&hash, &emission.payload)?;
    }
    let id = meta.create_resource(&name, &hash)?;
    tracing::debug!(
        file = %emission.name,
        resource = %name,
        hash = %&hash[..16],
        bytes = emission.payload.len(),
        "resource ingested"
    );
    Ok(id)
}

/// Drains the emission channel until every sender is gone.
pub struct ResourceIngester {
    handle: std::thread::JoinHandle<Result<u64, StateError>>,
}

impl ResourceIngester {
    /// Start the consumer thread for one batch.
    pub fn spawn(
        mut rx: mpsc::Receiver<FileEmission>,
        objects: Arc<ObjectStore>,
        meta: Arc<dyn MetaStore>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            let mut count = 0u64;
            while let Some(emission) = rx.blocking_recv() {
                ingest_emission(&objects, meta.as_ref(), &emission)?;
                count += 1;
            }
            Ok(count)
        });
        Self { handle }
    }

    /// Wait for the channel to drain; returns how many emissions landed.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Storage`] if ingestion hit the stores,
    /// [`PipelineError::Infrastructure`] if the thread panicked.
    pub fn join(self) -> Result<u64, PipelineError> {
        match self.handle.join() {
            Ok(result) => result.map_err(PipelineError::Storage),
            Err(_) => Err(PipelineError::Infrastructure(anyhow::anyhow!(
                "ingester thread panicked"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_state::SqliteMetaStore;

    fn stores() -> (tempfile::TempDir, Arc<ObjectStore>, Arc<dyn MetaStore>) {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(ObjectStore::open(dir.path()).unwrap());
        let meta: Arc<dyn MetaStore> = Arc::new(SqliteMetaStore::in_memory().unwrap());
        (dir, objects, meta)
    }

    fn emission(name: &str, payload: &[u8]) -> FileEmission {
        FileEmission {
            name: name.into(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn emission_becomes_blob_and_row() {
        let (_dir, objects, meta) = stores();
        ingest_emission(&objects, meta.as_ref(), &emission("page_1.html", b"<html>")).unwrap();

        let hash = sha256_hex(b"<html>");
        assert!(objects.exists(&hash));
        assert_eq!(objects.get(&hash).unwrap(), b"<html>");

        let rows = meta.resources_by_name("page").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].object_hash, hash);
    }

    #[test]
    fn identical_payloads_collapse_to_one_resource() {
        let (_dir, objects, meta) = stores();
        let a = ingest_emission(&objects, meta.as_ref(), &emission("page_1.html", b"same")).unwrap();
        let b = ingest_emission(&objects, meta.as_ref(), &emission("page_2.html", b"same")).unwrap();
        assert_eq!(a, b);
        assert_eq!(meta.count_resources().unwrap(), 1);
    }

    #[test]
    fn distinct_payloads_make_distinct_resources() {
        let (_dir, objects, meta) = stores();
        ingest_emission(&objects, meta.as_ref(), &emission("page_1.html", b"one")).unwrap();
        ingest_emission(&objects, meta.as_ref(), &emission("page_2.html", b"two")).unwrap();
        assert_eq!(meta.resources_by_name("page").unwrap().len(), 2);
    }

    #[test]
    fn ingester_drains_channel_until_senders_drop() {
        let (_dir, objects, meta) = stores();
        let (tx, rx) = mpsc::channel(4);
        let ingester = ResourceIngester::spawn(rx, objects.clone(), meta.clone());

        for i in 0..6u8 {
            tx.blocking_send(emission(&format!("chunk_{i}.bin"), &[i]))
                .unwrap();
        }
        drop(tx);

        assert_eq!(ingester.join().unwrap(), 6);
        assert_eq!(meta.resources_by_name("chunk").unwrap().len(), 6);
    }
}
