use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

/// Local alert played while a call is ringing. `stop` must be safe to call
/// when nothing is playing.
pub trait Ringer: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Headless ringer that only records whether it is playing.
#[derive(Default)]
pub struct SilentRinger {
    playing: AtomicBool,
    starts: AtomicUsize,
}

impl SilentRinger {
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl Ringer for SilentRinger {
    fn start(&self) {
        debug!("ringtone start");
        self.playing.store(true, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        if self.playing.swap(false, Ordering::SeqCst) {
            debug!("ringtone stop");
        }
    }
}
