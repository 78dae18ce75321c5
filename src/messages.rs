use std::sync::atomic::{AtomicBool, Ordering};

/// Stop flag shared between the window thread and the render thread. The
/// render loop checks it once per frame.
#[derive(Debug, Default)]
pub struct EngineControl {
    stop: AtomicBool,
}

impl EngineControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_sticky() {
        let control = EngineControl::new();
        assert!(control.is_running());
        control.request_stop();
        control.request_stop();
        assert!(!control.is_running());
    }
}
