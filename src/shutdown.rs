use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Shared stop flag, raised by SIGINT/SIGTERM. The runner checks it between
/// tasks, so the task in flight always reaches its queue flush.
#[derive(Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install signal handlers that raise the flag.
    pub fn install(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGINT, SIGTERM};
            use signal_hook::iterator::Signals;

            let requested = self.requested.clone();
            let mut signals = Signals::new([SIGTERM, SIGINT])?;

            std::thread::spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!(
                        "Received shutdown signal ({}), finishing the current task",
                        sig
                    );
                    requested.store(true, Ordering::SeqCst);
                }
            });
        }

        #[cfg(not(unix))]
        {
            signal_hook::flag::register(signal_hook::consts::SIGINT, self.requested.clone())?;
        }

        Ok(())
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn as_atomic(&self) -> &AtomicBool {
        &self.requested
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_starts_lowered() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_requested());
    }

    #[test]
    fn test_clones_share_state() {
        let flag = ShutdownFlag::new();
        let handle = flag.clone();
        handle.request();
        assert!(flag.is_requested());
        assert!(flag.as_atomic().load(Ordering::SeqCst));
    }
}
