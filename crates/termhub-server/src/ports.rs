//! Shared port allocation pool.
//!
//! The registry is a small JSON file shared by every process on the host.
//! Each read-modify-write holds an exclusive lock on a sibling `.lock` file
//! and replaces the registry atomically (temp file + rename).

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use termhub_core::{TermError, TermResult};
use tracing::{debug, info, warn};

/// Persisted pool state. `allocated` is kept within `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPool {
    pub start: u16,
    pub end: u16,
    #[serde(default)]
    pub allocated: BTreeSet<u16>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            allocated: BTreeSet::new(),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryFile {
    port_pool: PortPool,
}

/// Decides whether a port is free on this host right now.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding 127.0.0.1:port and dropping the listener straight away.
#[derive(Debug, Default)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

/// File-backed allocator over the pool. Blocking; call from `spawn_blocking`
/// in async contexts.
pub struct PortAllocator {
    path: PathBuf,
    start: u16,
    end: u16,
    probe: Box<dyn PortProbe>,
}

impl PortAllocator {
    /// `start`/`end` seed a registry that does not exist yet. An existing
    /// registry keeps its own range.
    pub fn new(path: impl Into<PathBuf>, start: u16, end: u16) -> Self {
        Self::with_probe(path, start, end, Box::new(BindProbe))
    }

    pub fn with_probe(
        path: impl Into<PathBuf>,
        start: u16,
        end: u16,
        probe: Box<dyn PortProbe>,
    ) -> Self {
        Self {
            path: path.into(),
            start,
            end,
            probe,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pool as currently persisted.
    pub fn snapshot(&self) -> TermResult<PortPool> {
        let _lock = self.lock()?;
        self.load()
    }

    /// Reserve `count` ports, lowest first. Nothing is reserved unless all
    /// `count` are found.
    pub fn allocate(&self, count: usize) -> TermResult<Vec<u16>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let _lock = self.lock()?;
        let mut pool = self.load()?;

        let mut found = Vec::with_capacity(count);
        for port in pool.start..=pool.end {
            if found.len() == count {
                break;
            }
            if pool.allocated.contains(&port) {
                continue;
            }
            if self.probe.is_free(port) {
                found.push(port);
            } else {
                debug!(port, "port in use, skipping");
            }
        }

        if found.len() < count {
            warn!(requested = count, available = found.len(), "port pool exhausted");
            return Err(TermError::PortsExhausted {
                requested: count,
                available: found.len(),
            });
        }

        pool.allocated.extend(found.iter().copied());
        self.store(&pool)?;
        info!(ports = ?found, "ports allocated");
        Ok(found)
    }

    /// Return ports to the pool. Ports that were not allocated are ignored.
    pub fn release(&self, ports: &[u16]) -> TermResult<()> {
        if ports.is_empty() {
            return Ok(());
        }

        let _lock = self.lock()?;
        let mut pool = self.load()?;
        let before = pool.allocated.len();
        for port in ports {
            pool.allocated.remove(port);
        }
        if pool.allocated.len() != before {
            self.store(&pool)?;
        }
        info!(ports = ?ports, released = before - pool.allocated.len(), "ports released");
        Ok(())
    }

    /// Held for the duration of one read-modify-write; released on drop.
    fn lock(&self) -> TermResult<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = self.path.with_extension("json.lock");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn load(&self) -> TermResult<PortPool> {
        if !self.path.exists() {
            return Ok(PortPool::new(self.start, self.end));
        }
        let content = std::fs::read_to_string(&self.path)?;
        let registry: RegistryFile = serde_json::from_str(&content).map_err(|e| {
            TermError::Config(format!(
                "invalid port registry {}: {e}",
                self.path.display()
            ))
        })?;
        let mut pool = registry.port_pool;
        let (start, end) = (pool.start, pool.end);
        pool.allocated.retain(|p| (start..=end).contains(p));
        Ok(pool)
    }

    fn store(&self, pool: &PortPool) -> TermResult<()> {
        let registry = RegistryFile {
            port_pool: pool.clone(),
        };
        let content = serde_json::to_string_pretty(&registry)?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.sync_all()?;

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}
