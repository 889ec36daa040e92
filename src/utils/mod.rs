pub mod config;
pub mod disk;
pub mod logging;
pub mod retry;
pub mod size;

pub use config::Config;
pub use retry::RetryPolicy;
pub use size::{format_size, parse_size, ByteSize};
