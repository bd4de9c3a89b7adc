pub use vmrep_types::error::{Result, VmrepError};
