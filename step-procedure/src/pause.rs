use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type SleepFn = dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync;

/// The sleep used between attempts by [`crate::Executor`], [`crate::Poller`]
/// and [`crate::NetworkRetry`].
///
/// Defaults to [`tokio::time::sleep`].
#[derive(Clone)]
pub struct Pause(Arc<SleepFn>);

impl Pause {
    pub fn tokio() -> Self {
        Self(Arc::new(|d| Box::pin(tokio::time::sleep(d))))
    }

    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Duration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Arc::new(move |d| Box::pin(f(d))))
    }

    /// A pause that returns immediately and records every requested delay.
    pub fn recording() -> (Self, Arc<Mutex<Vec<Duration>>>) {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let s = sleeps.clone();
        let pause = Self::from_fn(move |d| {
            if let Ok(mut v) = s.lock() {
                v.push(d);
            }
            std::future::ready(())
        });
        (pause, sleeps)
    }

    pub async fn sleep(&self, delay: Duration) {
        (self.0)(delay).await
    }
}

impl Default for Pause {
    fn default() -> Self {
        Self::tokio()
    }
}

impl fmt::Debug for Pause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pause")
    }
}
