use std::{future::Future, time::Duration};

/// Runtime is a wrapper around the different runtime libraries.
/// It is used by the worker pool to spawn workers, and by adapters for timed sleeps.
#[derive(Clone)]
pub enum Runtime {
    #[cfg(feature = "tokio")]
    Tokio(tokio::runtime::Handle),
    #[cfg(feature = "smol")]
    Smol,
}

#[derive(Debug, thiserror::Error)]
#[error("no async runtime is available in the current context")]
pub struct NoRuntimeError;

impl Runtime {
    /// Detect the runtime of the current context.
    /// A running tokio runtime is preferred, smol's global executor is the fallback.
    pub fn current() -> Result<Self, NoRuntimeError> {
        #[cfg(feature = "tokio")]
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            return Ok(Self::Tokio(handle));
        }
        Self::fallback()
    }

    #[cfg(feature = "smol")]
    fn fallback() -> Result<Self, NoRuntimeError> {
        Ok(Self::Smol)
    }

    #[cfg(not(feature = "smol"))]
    fn fallback() -> Result<Self, NoRuntimeError> {
        Err(NoRuntimeError)
    }

    pub fn spawn<T>(&self, future: impl Future<Output = T> + Send + 'static) -> JoinHandle<T>
    where
        T: Send + 'static,
    {
        match self {
            #[cfg(feature = "tokio")]
            Runtime::Tokio(handle) => JoinHandle::Tokio(handle.spawn(future)),
            #[cfg(feature = "smol")]
            Runtime::Smol => JoinHandle::Smol(smol::spawn(future)),
        }
    }
}

pub enum JoinHandle<T: Send + 'static> {
    #[cfg(feature = "tokio")]
    Tokio(tokio::task::JoinHandle<T>),
    #[cfg(feature = "smol")]
    Smol(smol::Task<T>),
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[cfg(feature = "tokio")]
    #[error(transparent)]
    Tokio(#[from] tokio::task::JoinError),
}

impl<T: Send + 'static> JoinHandle<T> {
    pub async fn join(self) -> Result<T, JoinError> {
        match self {
            #[cfg(feature = "tokio")]
            JoinHandle::Tokio(handle) => Ok(handle.await?),
            #[cfg(feature = "smol")]
            JoinHandle::Smol(task) => Ok(task.await),
        }
    }
}

/// Sleep for the given duration on whichever runtime is driving the caller.
pub async fn sleep(duration: Duration) {
    #[cfg(feature = "tokio")]
    if tokio::runtime::Handle::try_current().is_ok() {
        tokio::time::sleep(duration).await;
        return;
    }
    fallback_sleep(duration).await;
}

#[cfg(feature = "smol")]
async fn fallback_sleep(duration: Duration) {
    smol::Timer::after(duration).await;
}

#[cfg(not(feature = "smol"))]
async fn fallback_sleep(duration: Duration) {
    log::warn!("no timer available, skip sleeping for {:?}", duration);
}
