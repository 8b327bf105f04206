#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Stack overflow during compilation")]
    StackOverflow,

    #[error("Unsupported construct: {0}")]
    Unsupported(String),

    #[error("Syntax error at {line}:{column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Scope error: {0}")]
    Resolve(String),

    #[error("Uncaught exception: {0}")]
    Thrown(String),

    #[error("Simulator fault: {0}")]
    Simulator(String),

    #[error("No free register")]
    NoFreeRegister,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
