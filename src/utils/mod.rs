pub mod logging;

pub use logging::{short_id, truncate_text};
