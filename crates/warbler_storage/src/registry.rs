//! Namespace → container lookup.
//!
//! The embedding system resolves "the container for this site/workspace"
//! here. With the journal enabled each namespace journals into its own
//! subdirectory and is recovered from it on first open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use warbler_common::clock::{Clock, SystemClock};
use warbler_common::config::WarblerConfig;
use warbler_common::error::StorageError;
use warbler_common::types::Namespace;

use crate::container::StatusContainer;
use crate::journal::{JournalDurability, JournalReader};

pub struct ContainerRegistry {
    config: WarblerConfig,
    clock: Arc<dyn Clock>,
    containers: DashMap<Namespace, Arc<StatusContainer>>,
}

impl ContainerRegistry {
    pub fn new(config: WarblerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: WarblerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            containers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &WarblerConfig {
        &self.config
    }

    /// The container for `namespace`, created (and recovered) on first use.
    pub fn open(&self, namespace: impl Into<Namespace>) -> Result<Arc<StatusContainer>, StorageError> {
        match self.containers.entry(namespace.into()) {
            Entry::Occupied(e) => Ok(Arc::clone(e.get())),
            Entry::Vacant(e) => {
                let container = self.create(e.key())?;
                e.insert(Arc::clone(&container));
                Ok(container)
            }
        }
    }

    fn create(&self, namespace: &Namespace) -> Result<Arc<StatusContainer>, StorageError> {
        let builder = StatusContainer::builder(namespace.clone())
            .batch(self.config.batch.clone())
            .clock(Arc::clone(&self.clock));

        if !self.config.journal.enabled {
            return Ok(builder.build());
        }

        let dir = self.journal_dir(namespace);
        let changes = JournalReader::new(&dir).read_all()?;
        let durability = JournalDurability::open(&dir, &self.config.journal)?;
        let container = builder.durability(Arc::new(durability)).build();
        let applied = container.replay(changes)?;
        tracing::info!(
            namespace = %namespace,
            applied,
            records = container.len(),
            "recovered status container from {}",
            dir.display()
        );
        Ok(container)
    }

    /// Journal directory of `namespace` under the configured root.
    pub fn journal_dir(&self, namespace: &Namespace) -> PathBuf {
        Path::new(&self.config.journal.dir).join(namespace.dir_name())
    }

    pub fn get(&self, namespace: &Namespace) -> Option<Arc<StatusContainer>> {
        self.containers.get(namespace).map(|e| Arc::clone(e.value()))
    }

    /// Open namespaces, sorted.
    pub fn namespaces(&self) -> Vec<Namespace> {
        let mut names: Vec<Namespace> = self.containers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Close every container. All are attempted; the first error is
    /// returned after the rest have been closed.
    pub fn close_all(&self) -> Result<usize, StorageError> {
        let containers: Vec<Arc<StatusContainer>> =
            self.containers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut persisted = 0usize;
        let mut first_err = None;
        for container in containers {
            match container.close() {
                Ok(n) => persisted += n,
                Err(e) => {
                    tracing::error!(
                        namespace = %container.namespace(),
                        "close failed: {}",
                        e
                    );
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(persisted),
        }
    }
}
