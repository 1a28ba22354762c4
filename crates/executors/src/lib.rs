pub mod command;
pub mod error;
pub mod result_parser;

pub use command::{build_launch_spec, LaunchSpec};
pub use error::{CommandBuildError, ParseError};
pub use result_parser::{ParsedResult, ParserConfig, ResultParser};
