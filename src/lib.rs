//! aix and manx send one prompt to an OpenAI compatible chat completion API
//! and print the answer, either at once or streamed as it is generated.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod output;
pub mod result;
pub mod runner;

pub use error::{Error, Result, StreamError};
pub use result::{CompletionResult, CompletionStream};
pub use runner::Runner;
