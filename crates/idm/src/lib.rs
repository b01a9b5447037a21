pub mod client;

pub use client::{IdmClient, IdmError};
