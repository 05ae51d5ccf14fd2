pub mod cache;
pub mod util;
