pub mod error;
pub mod object_ref;

pub use object_ref::ObjRef;
