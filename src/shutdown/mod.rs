use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::logging::Logger;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&triggered))?;
            Ok(Self {
                triggered,
                sig_ids: vec![id_int, id_term],
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Requests shutdown from inside the process, as if a signal had arrived.
    #[cfg(test)]
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

pub type ForcedExitAction = Box<dyn FnOnce() + Send + 'static>;

/// Fires `action` once `delay` elapses unless disarmed first.
///
/// The production action exits the process with code 1, bounding how long a
/// stalled teardown can keep the process alive.
pub struct ForcedExitTimer {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ForcedExitTimer {
    pub fn arm(delay: Duration, action: ForcedExitAction) -> io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("forced-exit-timer".to_owned())
            .spawn(move || match cancelled.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => action(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            })?;

        Ok(Self {
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }

    pub fn disarm(mut self) {
        self.cancel_and_join();
    }

    fn cancel_and_join(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ForcedExitTimer {
    fn drop(&mut self) {
        self.cancel_and_join();
    }
}

/// Ordered teardown steps run under a forced-exit timer.
pub struct ShutdownSequence<'a> {
    steps: Vec<(&'static str, Box<dyn FnOnce() + 'a>)>,
    logger: Logger,
}

impl<'a> ShutdownSequence<'a> {
    pub fn new(logger: Logger) -> Self {
        Self {
            steps: Vec::new(),
            logger,
        }
    }

    pub fn step(mut self, name: &'static str, action: impl FnOnce() + 'a) -> Self {
        self.steps.push((name, Box::new(action)));
        self
    }

    /// Runs every step in order. `on_stall` fires if they have not all
    /// finished within `grace`.
    pub fn run(self, grace: Duration, on_stall: ForcedExitAction) {
        let timer = match ForcedExitTimer::arm(grace, on_stall) {
            Ok(timer) => Some(timer),
            Err(error) => {
                self.logger.warn(
                    Some("shutdown::sequence"),
                    &format!("forced-exit timer unavailable, shutdown is unbounded: {error}"),
                );
                None
            }
        };

        for (name, action) in self.steps {
            self.logger
                .debug(Some("shutdown::sequence"), &format!("running step '{name}'"));
            action();
        }

        if let Some(timer) = timer {
            timer.disarm();
        }
    }
}
