use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use uuid::Uuid;

use super::CancellableTask;
use crate::{Result, UploadError};

pub type ClientId = u64;

/// Anything the registry can track: it must report when it is finished
/// and call back once it finishes.
pub trait RegisteredJob: Send + Sync + 'static {
    fn is_finished(&self) -> bool;

    fn on_finished(&self, callback: Box<dyn FnOnce() + Send>);
}

impl<T> RegisteredJob for CancellableTask<T>
where
    T: Clone + Send + 'static,
{
    fn is_finished(&self) -> bool {
        self.is_terminal()
    }

    fn on_finished(&self, callback: Box<dyn FnOnce() + Send>) {
        self.on_complete(move |_| callback());
    }
}

struct Entry<J> {
    ticket: Uuid,
    job: Arc<J>,
}

type Entries<J> = Mutex<HashMap<ClientId, Entry<J>>>;

/// Jobs in flight, at most one per client.
///
/// An entry is removed by its job's completion callback, not before, and
/// only if it still is the entry that callback was registered for.
pub struct TaskRegistry<J> {
    entries: Arc<Entries<J>>,
}

impl<J> Default for TaskRegistry<J> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<J: RegisteredJob> TaskRegistry<J> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the job built by `create` for `client`.
    ///
    /// Fails with `AlreadyPendingRequest` while the client's previous job is
    /// unfinished, leaving that job untouched. If `create` fails, nothing is
    /// registered.
    pub fn begin<F>(&self, client: ClientId, create: F) -> Result<Arc<J>>
    where
        F: FnOnce() -> Result<J>,
    {
        let ticket = Uuid::new_v4();
        let job = {
            let mut entries = self.lock();
            if let Some(entry) = entries.get(&client) {
                if !entry.job.is_finished() {
                    log::warn!(
                        "registry: client {} already has a pending request",
                        client
                    );
                    return Err(UploadError::AlreadyPendingRequest);
                }
            }
            let job = Arc::new(create()?);
            entries.insert(
                client,
                Entry {
                    ticket,
                    job: Arc::clone(&job),
                },
            );
            job
        };

        // registered outside the lock: an already finished job calls back
        // immediately
        let entries: Weak<Entries<J>> = Arc::downgrade(&self.entries);
        job.on_finished(Box::new(move || {
            if let Some(entries) = entries.upgrade() {
                let mut entries =
                    entries.lock().unwrap_or_else(PoisonError::into_inner);
                if entries.get(&client).map(|e| e.ticket) == Some(ticket) {
                    entries.remove(&client);
                    log::debug!(
                        "registry: client {} finished {}",
                        client,
                        ticket
                    );
                }
            }
        }));
        Ok(job)
    }

    pub fn get(&self, client: ClientId) -> Option<Arc<J>> {
        self.lock().get(&client).map(|entry| Arc::clone(&entry.job))
    }

    pub fn remove(&self, client: ClientId) -> Option<Arc<J>> {
        self.lock().remove(&client).map(|entry| entry.job)
    }

    pub fn jobs(&self) -> Vec<(ClientId, Arc<J>)> {
        self.lock()
            .iter()
            .map(|(client, entry)| (*client, Arc::clone(&entry.job)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, Entry<J>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
