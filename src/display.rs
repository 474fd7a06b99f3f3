//! the display capability the engine dispatches to
use {
    crate::{images::decode::DecodedImage, models::ImageRef},
    std::sync::Mutex,
    tracing::info,
};

/// per-monitor display collaborator
///
/// implemented by the GUI shell; the engine only ever talks to this trait.
pub trait Display: Send + Sync {
    /// pixel sizes of the attached monitors, primary first
    fn monitor_sizes(&self) -> Vec<(u32, u32)>;

    /// show an image on one monitor
    fn show(&self, monitor: usize, image_ref: &ImageRef, image: &DecodedImage, mode: &str);

    /// show a textual error placeholder on every monitor
    fn show_error(&self, message: &str);

    /// blank every monitor
    fn clear(&self);

    /// number of attached monitors
    fn monitor_count(&self) -> usize {
        self.monitor_sizes().len()
    }
}

/// headless display that logs dispatches, used by the demo binary and tests
pub struct ConsoleDisplay {
    monitors: Vec<(u32, u32)>,
    shown: Mutex<Vec<(usize, String)>>,
    errors: Mutex<Vec<String>>,
}

impl ConsoleDisplay {
    /// pretend to have the given monitor sizes
    pub fn new(monitors: Vec<(u32, u32)>) -> Self {
        Self {
            monitors,
            shown: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// everything shown so far as `(monitor, key)` pairs
    pub fn shown(&self) -> Vec<(usize, String)> {
        self.shown.lock().expect("display log poisoned").clone()
    }

    /// error placeholders shown so far
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("display log poisoned").clone()
    }
}

impl Default for ConsoleDisplay {
    fn default() -> Self {
        Self::new(vec![(1920, 1080)])
    }
}

impl Display for ConsoleDisplay {
    fn monitor_sizes(&self) -> Vec<(u32, u32)> {
        self.monitors.clone()
    }

    fn show(&self, monitor: usize, image_ref: &ImageRef, image: &DecodedImage, mode: &str) {
        info!(
            "[monitor {}] {} ({}x{}, mode={})",
            monitor,
            image_ref.display_name(),
            image.width(),
            image.height(),
            mode
        );
        self.shown
            .lock()
            .expect("display log poisoned")
            .push((monitor, image_ref.key()));
    }

    fn show_error(&self, message: &str) {
        info!("[display] error placeholder: {}", message);
        self.errors
            .lock()
            .expect("display log poisoned")
            .push(message.to_string());
    }

    fn clear(&self) {
        info!("[display] cleared");
    }
}
