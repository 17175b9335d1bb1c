pub mod command;
pub mod env;
pub mod error;
pub mod resolve;

pub use command::{format_g, quote, render, Command, FlagValue, Fragment};
pub use env::{EnvPropagation, PROPAGATED_VARIABLES};
pub use error::{TuneError, TuneResult};
pub use resolve::{ExecutableResolver, Toolkit};
