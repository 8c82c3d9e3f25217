//! Single-writer observable state.
//!
//! A [`StateHolder`] is a named slot with exactly one logical writer and any
//! number of readers. Writes may come from any task or thread: they are sent
//! as mutations to a dedicated actor task that applies them one at a time, in
//! order, and publishes the result. Readers never see a half-applied update.
//!
//! Readers get the latest value only. A value superseded before a reader looked
//! at it is skipped, and a mutation that leaves the value unchanged does not
//! wake readers at all.
//!
//! ```rust,ignore
//! let slot = StateHolder::new("connection", false);
//! let mut reader = slot.reader();
//!
//! slot.set(true);
//! reader.changed().await?;
//! assert!(reader.get());
//! ```

use std::fmt;

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Error, Result};

type Mutation<T> = Box<dyn FnOnce(&mut T) -> bool + Send>;

enum Command<T> {
    Apply(Mutation<T>),
    Flush(oneshot::Sender<()>),
}

/// Writer side of a state slot.
///
/// Not `Clone`: the component that owns the holder is the only writer.
pub struct StateHolder<T> {
    name: &'static str,
    commands: mpsc::UnboundedSender<Command<T>>,
    published: watch::Receiver<T>,
}

impl<T: fmt::Debug> fmt::Debug for StateHolder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHolder")
            .field("name", &self.name)
            .field("value", &*self.published.borrow())
            .finish()
    }
}

impl<T> StateHolder<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a slot and spawn its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: &'static str, initial: T) -> Self {
        let (commands, mut queue) = mpsc::unbounded_channel::<Command<T>>();
        let (publisher, published) = watch::channel(initial);

        tokio::spawn(async move {
            while let Some(command) = queue.recv().await {
                match command {
                    Command::Apply(mutation) => {
                        publisher.send_if_modified(mutation);
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::trace!("State slot '{}' writer finished", name);
        });

        Self {
            name,
            commands,
            published,
        }
    }

    /// Slot name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Replace the value. Readers are only woken if it actually changed.
    pub fn set(&self, value: T) {
        self.update(move |current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Queue a mutation. The closure returns whether it modified the value.
    pub fn update<F>(&self, mutation: F)
    where
        F: FnOnce(&mut T) -> bool + Send + 'static,
    {
        if self.commands.send(Command::Apply(Box::new(mutation))).is_err() {
            tracing::warn!("State slot '{}' dropped a write after shutdown", self.name);
        }
    }

    /// Wait until every write queued before this call has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateClosed`] if the writer task is gone.
    pub async fn flush(&self) -> Result<()> {
        let (done, applied) = oneshot::channel();
        self.commands
            .send(Command::Flush(done))
            .map_err(|_| Error::StateClosed(self.name))?;
        applied.await.map_err(|_| Error::StateClosed(self.name))
    }

    /// Latest published value.
    #[must_use]
    pub fn snapshot(&self) -> T {
        self.published.borrow().clone()
    }

    /// Create a reader handle.
    #[must_use]
    pub fn reader(&self) -> StateReader<T> {
        StateReader {
            name: self.name,
            inner: self.published.clone(),
        }
    }
}

/// Read side of a state slot. Cheap to clone; hand one to every observer.
#[derive(Clone)]
pub struct StateReader<T> {
    name: &'static str,
    inner: watch::Receiver<T>,
}

impl<T: fmt::Debug> fmt::Debug for StateReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateReader")
            .field("name", &self.name)
            .field("value", &*self.inner.borrow())
            .finish()
    }
}

impl<T: Clone> StateReader<T> {
    /// Latest value, marking it as seen.
    #[must_use]
    pub fn get(&mut self) -> T {
        self.inner.borrow_and_update().clone()
    }

    /// Latest value without marking it as seen.
    #[must_use]
    pub fn peek(&self) -> T {
        self.inner.borrow().clone()
    }

    /// Wait for a value newer than the last one seen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateClosed`] once the writer is gone.
    pub async fn changed(&mut self) -> Result<T> {
        self.inner
            .changed()
            .await
            .map_err(|_| Error::StateClosed(self.name))?;
        Ok(self.get())
    }

    /// Wait until the value satisfies `predicate`, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateClosed`] once the writer is gone.
    pub async fn wait_until<F>(&mut self, mut predicate: F) -> Result<T>
    where
        F: FnMut(&T) -> bool,
    {
        let value = self
            .inner
            .wait_for(|v| predicate(v))
            .await
            .map_err(|_| Error::StateClosed(self.name))?;
        Ok(value.clone())
    }
}
