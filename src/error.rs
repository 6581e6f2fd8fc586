use thiserror::Error;

#[derive(Debug, Error)]
pub enum FitError {
    #[error("malformed pose data: {message}")]
    Format { message: String },
    #[error("noise calibration failed: {message}")]
    Calibration { message: String },
    #[error("latent dimension infeasible: {message}")]
    Dimensionality { message: String },
    #[error("non-finite model state at iteration {iteration}: {message}")]
    NumericalInstability { iteration: usize, message: String },
    #[error("invalid configuration: {message}")]
    Config { message: String },
    #[error("checkpoint incompatible with current configuration: {message}")]
    Resume { message: String },
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl FitError {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    pub(crate) fn calibration(message: impl Into<String>) -> Self {
        Self::Calibration {
            message: message.into(),
        }
    }

    pub(crate) fn dimensionality(message: impl Into<String>) -> Self {
        Self::Dimensionality {
            message: message.into(),
        }
    }

    pub(crate) fn numerical(iteration: usize, message: impl Into<String>) -> Self {
        Self::NumericalInstability {
            iteration,
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn resume(message: impl Into<String>) -> Self {
        Self::Resume {
            message: message.into(),
        }
    }

    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }
}
