//! upstack - Local product-stack registry cache
//!
//! Tracks which software products (name, version, platform flavor) are
//! declared in a product database, which tags point at which versions, and
//! keeps per-flavor snapshot files on disk so the database does not have to
//! be rescanned on every invocation.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod family;
pub mod flavor;
pub mod lock;
pub mod product;
pub mod stack;
pub mod table;

pub use error::{UpstackError, UpstackResult};
pub use product::Product;
pub use stack::ProductStack;
