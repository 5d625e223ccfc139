//! Utilities module - identifier generation and index-safe encodings

pub mod codec;
pub mod ids;

pub use codec::{decode_url, encode_url};
pub use ids::{next_id, now_millis};
