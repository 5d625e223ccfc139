use lazy_static::lazy_static;
use std::sync::Mutex;
use ulid::{Generator, Ulid};

lazy_static! {
    static ref GENERATOR: Mutex<Generator> = Mutex::new(Generator::new());
}

/// Returns a ULID string that sorts after every id this process issued before it.
pub fn next_id() -> String {
    let generated = GENERATOR
        .lock()
        .ok()
        .and_then(|mut generator| generator.generate().ok());
    // Overflow within one millisecond or a poisoned lock falls back to a random ULID.
    generated.unwrap_or_else(Ulid::new).to_string()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
