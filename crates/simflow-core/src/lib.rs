pub mod config;
pub mod error;
pub mod health;
pub mod io;
pub mod mailbox;
pub mod paths;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod script;
pub mod selection;
pub mod store;
pub mod submit;
pub mod task;
pub mod types;

pub use error::{Result, SimflowError};
