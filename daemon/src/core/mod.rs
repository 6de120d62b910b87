pub mod chunker;
pub mod error;
pub mod gateway;
pub mod objectstore;
pub mod packer;
pub mod queue;
pub mod signer;
pub mod storage;
pub mod workers;

mod bundle_format;
pub use bundle_format::*;
