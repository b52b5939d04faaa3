use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar,ProgressStyle};

pub struct CLProgressBar {
    pb: Option<ProgressBar>,
    message: Mutex<String>
}

impl CLProgressBar {
    pub fn new(work: u64, enabled: bool) -> Self {
        let pb = if enabled {
            let pb = ProgressBar::new(work);
            let template = "[{msg}] {wide_bar} ({per_sec}) {pos:>7}/{len:7} - Elapsed: {elapsed_precise}, Remaining: {eta_precise}";

            // A bad template only costs us the styling
            if let Ok(style) = ProgressStyle::default_bar().template(template) {
                pb.set_style(style);
            }

            // Update in separate thread
            pb.enable_steady_tick(Duration::from_millis(200));
            Some(pb)
        } else {
            None
        };

        CLProgressBar {
            pb,
            message: Mutex::new(String::new())
        }
    }

    pub fn update_message<F>(&self, update_message: F)
    where
        F: Fn(&mut String)
    {
        // A poisoned lock only means another thread panicked mid-message
        let mut msg = match self.message.lock() {
            Ok(msg) => msg,
            Err(poisoned) => poisoned.into_inner()
        };

        update_message(&mut msg);

        if let Some(pb) = &self.pb {
            pb.set_message(msg.clone());
        }
    }

    pub fn inc(&self, amt: u64) {
        if let Some(pb) = &self.pb {
            pb.inc(amt);
        }
    }

    pub fn finish(&self) {
        if let Some(pb) = &self.pb {
            pb.finish();
        }
    }
}
