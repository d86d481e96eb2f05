pub mod rate_limiter;
pub mod text;

pub use rate_limiter::SlidingWindowLimiter;
pub use text::{clean_html, decode_entities, prefix_chars, truncate_chars};
