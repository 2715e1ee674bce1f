//! Bounded pool of reusable protocol clients

use std::ops::Deref;
use std::sync::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{StorageError, StorageResult};

type ClientFactory<T> = Box<dyn Fn() -> StorageResult<T> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
}

/// At most `max_size` clients exist at once; idle ones are reused.
pub struct ClientPool<T> {
    idle: Mutex<Vec<T>>,
    permits: Semaphore,
    factory: ClientFactory<T>,
    max_size: usize,
}

impl<T: Send> ClientPool<T> {
    pub fn new<F>(max_size: usize, factory: F) -> Self
    where
        F: Fn() -> StorageResult<T> + Send + Sync + 'static,
    {
        let max_size = max_size.max(1);
        Self {
            idle: Mutex::new(Vec::with_capacity(max_size)),
            permits: Semaphore::new(max_size),
            factory: Box::new(factory),
            max_size,
        }
    }

    /// Wait for a free slot, then hand out an idle client or build a new one.
    ///
    /// The client goes back to the pool when the guard is dropped, whatever
    /// the exit path.
    pub async fn acquire(&self, cancel: &CancellationToken) -> StorageResult<PooledClient<'_, T>> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            permit = self.permits.acquire() => permit
                .map_err(|_| StorageError::Internal("Client pool is closed".to_string()))?,
        };

        let reused = self.lock_idle().pop();
        let client = match reused {
            Some(client) => client,
            None => {
                debug!("Creating new pooled client ({} max)", self.max_size);
                (self.factory)()?
            }
        };

        Ok(PooledClient {
            client: Some(client),
            pool: self,
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.permits.available_permits();
        PoolStats {
            max_size: self.max_size,
            idle: self.lock_idle().len(),
            in_use: self.max_size - available,
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, client: T) {
        self.lock_idle().push(client);
    }
}

pub struct PooledClient<'a, T: Send> {
    client: Option<T>,
    pool: &'a ClientPool<T>,
    // Dropped after `Drop::drop` returns the client, so the slot frees last.
    _permit: SemaphorePermit<'a>,
}

impl<T: Send> Deref for PooledClient<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.client.as_ref().expect("pooled client is present until drop")
    }
}

impl<T: Send> Drop for PooledClient<'_, T> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
        }
    }
}
