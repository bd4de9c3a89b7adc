mod defaults;
mod resolve;
mod types;

pub use self::resolve::{load_job_config, parse_job_config};
pub use self::types::*;
