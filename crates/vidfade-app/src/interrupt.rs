use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide stop request. Starts clear and, once raised, stays raised.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag on SIGINT. The handler does nothing else.
    pub fn install_sigint(&self) -> anyhow::Result<()> {
        let flag = self.0.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;
        Ok(())
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_flag_is_seen_by_every_clone() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        assert!(!other.is_raised());
        flag.raise();
        assert!(other.is_raised());
        flag.raise();
        assert!(flag.is_raised());
    }
}
