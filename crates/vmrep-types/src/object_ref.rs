use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to a hypervisor object (VM, VDI, SR).
///
/// The value is only meaningful to the hypervisor connection that issued it;
/// uuids are what gets persisted in tags.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjRef(pub String);

impl ObjRef {
    pub fn new(value: impl Into<String>) -> Self {
        ObjRef(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hypervisor's null reference, used for "no object".
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0 == "OpaqueRef:NULL"
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({})", self.0)
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjRef {
    fn from(value: &str) -> Self {
        ObjRef(value.to_string())
    }
}
