pub mod archive;
pub mod config;
pub mod console;
pub mod context;
pub mod error;
pub mod platform;
pub mod process;
pub mod provision;
pub mod release;
pub mod runtime;
pub mod supervisor;
pub mod update;

pub use error::{Result, WrapperError};
