pub mod id;

pub use id::PrefixedId;
