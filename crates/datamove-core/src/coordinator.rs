use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::compression::{ChunkWriter, Compression};
use crate::flush::ChunkWriterFactory;
use crate::pipe::pipe;
use crate::{Error, Resource, Result, Store, VerifiedTable};

const CHUNK_PIPE_CAPACITY: usize = 8;

#[derive(Default)]
struct UploadState {
    resources: Vec<(usize, Arc<dyn Resource>)>,
    error: Option<Error>,
}

/// Turns chunks into resources with a bounded number of uploads in flight.
///
/// Each upload holds one permit of the gate until its result is recorded,
/// and a new chunk is only handed out after the gate admits it and no
/// earlier upload has failed. With one permit, chunk `n + 1` cannot start
/// before chunk `n` has finished.
pub struct UploadCoordinator {
    store: Arc<dyn Store>,
    table: VerifiedTable,
    compression: Compression,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
    next_ordinal: usize,
    tasks: Vec<JoinHandle<()>>,
    state: Arc<Mutex<UploadState>>,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        table: VerifiedTable,
        compression: Compression,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            table,
            compression,
            gate: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel,
            next_ordinal: 0,
            tasks: Vec::new(),
            state: Arc::new(Mutex::new(UploadState::default())),
        }
    }

    /// Wait for every upload started so far.
    ///
    /// Returns the resources in ordinal order, or the combined upload error.
    /// Calling this again returns the same outcome without blocking.
    pub async fn wait(&mut self) -> Result<Vec<Arc<dyn Resource>>> {
        for handle in std::mem::take(&mut self.tasks) {
            if let Err(join_err) = handle.await {
                let err = Error::Storage(format!("upload task failed: {}", join_err));
                let mut state = self.state.lock().await;
                state.error = Error::combine_opt(state.error.take(), Err(err));
            }
        }

        let mut state = self.state.lock().await;
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        state.resources.sort_by_key(|(ordinal, _)| *ordinal);
        Ok(state.resources.iter().map(|(_, r)| r.clone()).collect())
    }

    async fn failure(&self) -> Option<Error> {
        self.state.lock().await.error.clone()
    }
}

#[async_trait]
impl ChunkWriterFactory for UploadCoordinator {
    async fn new_writer(&mut self, num_rows: oneshot::Receiver<usize>) -> Result<ChunkWriter> {
        let permit = tokio::select! {
            permit = self.gate.clone().acquire_owned() => {
                permit.map_err(|_| Error::Storage("upload gate closed".to_string()))?
            }
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };
        // An earlier chunk failed: refuse new work instead of starting an
        // upload whose result nobody would collect.
        if let Some(err) = self.failure().await {
            return Err(err);
        }
        self.tasks.retain(|handle| !handle.is_finished());

        self.next_ordinal += 1;
        let ordinal = self.next_ordinal;
        let (writer, reader) = pipe(CHUNK_PIPE_CAPACITY, &self.cancel);

        let store = self.store.clone();
        let table = self.table.clone();
        let state = self.state.clone();
        let file_ext = self.compression.file_extension();
        debug!(table = %table.name, ordinal, "starting chunk upload");

        self.tasks.push(tokio::spawn(async move {
            let _permit = permit;
            let closer = reader.closer();
            let result = store
                .create_from_reader(reader, &table, ordinal, file_ext, num_rows)
                .await;

            let mut state = state.lock().await;
            match result {
                Ok(resource) => {
                    debug!(table = %table.name, ordinal, key = %resource.key(), "chunk uploaded");
                    state.resources.push((ordinal, resource));
                }
                Err(err) => {
                    error!(table = %table.name, ordinal, error = %err, "error during data store write");
                    closer.close_with_error(err.clone());
                    state.error = Error::combine_opt(state.error.take(), Err(err));
                }
            }
        }));

        Ok(ChunkWriter::new(writer, self.compression))
    }
}
