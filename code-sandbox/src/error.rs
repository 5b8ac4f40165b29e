use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Language not supported: {0}")]
    UnsupportedLanguage(String),

    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("System error: {0}")]
    System(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Container engine error: {0}")]
    ContainerEngine(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Security analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
