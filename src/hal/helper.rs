use std::{thread, time::Duration};

pub fn wait_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}
