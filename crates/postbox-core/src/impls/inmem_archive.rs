//! InMemoryArchiveProvider - 開発用の archive target

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::Message;
use crate::ports::{ArchiveError, ArchiveProvider};

/// Keeps archived messages in a `Vec` for inspection.
#[derive(Debug, Default)]
pub struct InMemoryArchiveProvider {
    archived: Mutex<Vec<Message>>,
}

impl InMemoryArchiveProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.archived.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ArchiveProvider for InMemoryArchiveProvider {
    fn archive_message(&self, message: &Message) -> Result<(), ArchiveError> {
        self.lock().push(message.clone());
        Ok(())
    }
}
