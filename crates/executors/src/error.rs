use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("unknown dev environment kind `{0}`")]
    UnknownKind(String),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no result strategy matched the execution log")]
    NoStrategyMatched,
    #[error("result object missing required field `{0}`")]
    MissingField(&'static str),
    #[error("result object field `{0}` had the wrong type")]
    WrongFieldType(&'static str),
    #[error("result parsing exceeded the configured parser timeout")]
    Timeout,
}
