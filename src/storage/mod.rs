//! Block storage read contract
//!
//! The loader issues one read per package payload and is called back
//! with the bytes or an error. "Not found" means the package is not
//! mounted; any other error fails only that package.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::package::{ContainerId, PackageId};

/// What a chunk holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    GlobalNames,
    InitialLoadMeta,
    ContainerHeader,
    ExportBundleData,
}

/// Address of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub container: ContainerId,
    pub index: u64,
    pub kind: ChunkType,
}

impl ChunkId {
    /// Export payload of `package`
    pub fn export_bundle_data(
        container: ContainerId,
        package: PackageId,
    ) -> Self {
        Self {
            container,
            index: package.value(),
            kind: ChunkType::ExportBundleData,
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?}[{}:{:#x}]", self.kind, self.container, self.index)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("chunk {0} not found")]
    NotFound(ChunkId),

    #[error("I/O error reading {chunk}: {reason}")]
    Io { chunk: ChunkId, reason: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Completion for one read; may run on any thread, including inline
pub type ReadCallback = Box<dyn FnOnce(StorageResult<Arc<[u8]>>) + Send + 'static>;

/// The block storage contract consumed by the loader
pub trait BlockStorage: Send + Sync {
    fn request_read(
        &self,
        chunk: ChunkId,
        priority: i32,
        callback: ReadCallback,
    );
}

/// When [`MemoryStorage`] completes reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Inside `request_read`
    #[default]
    Immediate,
    /// On a dedicated I/O thread
    Deferred,
    /// Only when the caller asks, via `complete_next`/`complete_all`
    Manual,
}

type ReadJob = (ChunkId, ReadCallback);

/// In-memory chunk store
pub struct MemoryStorage {
    mode: CompletionMode,
    pending: Mutex<VecDeque<ReadJob>>,
    io_thread: Mutex<Option<(Sender<ReadJob>, JoinHandle<()>)>>,
    shared: Arc<Mutex<StorageShared>>,
}

/// State the I/O thread also reads
#[derive(Default)]
struct StorageShared {
    chunks: HashMap<ChunkId, Arc<[u8]>>,
    failures: HashSet<ChunkId>,
    reads: u64,
}

impl MemoryStorage {
    pub fn new(mode: CompletionMode) -> Self {
        let shared = Arc::new(Mutex::new(StorageShared::default()));
        let mut mode = mode;
        let io_thread = match mode {
            CompletionMode::Deferred => {
                let io_thread = spawn_io_thread(shared.clone());
                if io_thread.is_none() {
                    mode = CompletionMode::Immediate;
                }
                io_thread
            }
            _ => None,
        };
        Self {
            mode,
            pending: Mutex::new(VecDeque::new()),
            io_thread: Mutex::new(io_thread),
            shared,
        }
    }

    #[inline]
    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    pub fn insert(
        &self,
        chunk: ChunkId,
        data: Vec<u8>,
    ) {
        self.shared.lock().chunks.insert(chunk, data.into());
    }

    /// Store a package payload
    pub fn insert_package(
        &self,
        container: ContainerId,
        package: PackageId,
        data: Vec<u8>,
    ) {
        self.insert(ChunkId::export_bundle_data(container, package), data);
    }

    /// Make every read of `chunk` fail with an I/O error
    pub fn fail_chunk(
        &self,
        chunk: ChunkId,
    ) {
        self.shared.lock().failures.insert(chunk);
    }

    /// Reads waiting for `complete_next`
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Reads issued so far
    pub fn read_count(&self) -> u64 {
        self.shared.lock().reads
    }

    /// Complete the oldest manual read. Returns false if none was pending.
    pub fn complete_next(&self) -> bool {
        let job = self.pending.lock().pop_front();
        match job {
            Some((chunk, callback)) => {
                callback(lookup(&self.shared, chunk));
                true
            }
            None => false,
        }
    }

    /// Complete every manual read, including ones issued by callbacks
    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(CompletionMode::Immediate)
    }
}

fn lookup(
    shared: &Mutex<StorageShared>,
    chunk: ChunkId,
) -> StorageResult<Arc<[u8]>> {
    let shared = shared.lock();
    if shared.failures.contains(&chunk) {
        return Err(StorageError::Io {
            chunk,
            reason: "injected failure".to_string(),
        });
    }
    shared
        .chunks
        .get(&chunk)
        .cloned()
        .ok_or(StorageError::NotFound(chunk))
}

fn spawn_io_thread(shared: Arc<Mutex<StorageShared>>) -> Option<(Sender<ReadJob>, JoinHandle<()>)> {
    let (sender, receiver) = unbounded::<ReadJob>();
    let spawned = thread::Builder::new()
        .name("pkgflow-io".to_string())
        .spawn(move || {
            for (chunk, callback) in receiver {
                trace!("io thread reading {}", chunk);
                callback(lookup(&shared, chunk));
            }
            debug!("io thread stopped");
        });
    match spawned {
        Ok(handle) => Some((sender, handle)),
        Err(err) => {
            warn!("failed to spawn I/O thread, completing reads inline: {}", err);
            None
        }
    }
}

impl BlockStorage for MemoryStorage {
    fn request_read(
        &self,
        chunk: ChunkId,
        priority: i32,
        callback: ReadCallback,
    ) {
        trace!("read {} at priority {}", chunk, priority);
        self.shared.lock().reads += 1;
        match self.mode {
            CompletionMode::Immediate => callback(lookup(&self.shared, chunk)),
            CompletionMode::Manual => self.pending.lock().push_back((chunk, callback)),
            CompletionMode::Deferred => {
                let io_thread = self.io_thread.lock();
                match io_thread.as_ref() {
                    Some((sender, _)) => {
                        if let Err(err) = sender.send((chunk, callback)) {
                            let (chunk, callback) = err.into_inner();
                            callback(Err(StorageError::Io {
                                chunk,
                                reason: "I/O thread stopped".to_string(),
                            }));
                        }
                    }
                    None => {
                        drop(io_thread);
                        callback(Err(StorageError::Io {
                            chunk,
                            reason: "storage shut down".to_string(),
                        }));
                    }
                }
            }
        }
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        if let Some((sender, handle)) = self.io_thread.lock().take() {
            drop(sender);
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for MemoryStorage {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("mode", &self.mode)
            .field("chunks", &self.shared.lock().chunks.len())
            .field("failures", &self.shared.lock().failures.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}
