use dashmap::DashMap;
use std::process::Child;
use std::sync::{Arc, Mutex, PoisonError};

/// Live child processes, shared between the worker and whoever cancels it.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    live: DashMap<u32, Arc<Mutex<Child>>>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tracks `child` until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, pid: u32, child: Arc<Mutex<Child>>) -> RegistryGuard {
        self.live.insert(pid, child);
        tracing::trace!("Registered child process {}", pid);
        RegistryGuard {
            registry: self.clone(),
            pid,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Best-effort kill of every live child. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let children: Vec<(u32, Arc<Mutex<Child>>)> = self
            .live
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        children
            .into_iter()
            .filter(|(pid, child)| {
                let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
                match child.kill() {
                    Ok(_) => {
                        tracing::debug!("Killed child process {}", pid);
                        true
                    }
                    Err(e) => {
                        tracing::debug!("Could not kill child process {}: {}", pid, e);
                        false
                    }
                }
            })
            .count()
    }
}

/// Removes its process from the registry on drop, whether it exited or was killed.
#[derive(Debug)]
pub struct RegistryGuard {
    registry: Arc<ProcessRegistry>,
    pid: u32,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.live.remove(&self.pid);
        tracing::trace!("Unregistered child process {}", self.pid);
    }
}
