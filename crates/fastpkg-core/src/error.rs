use thiserror::Error;

/// Core error type for fastpkg configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid registry URL '{url}': {source}")]
    InvalidRegistry {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid value '{value}' for {key}")]
    InvalidSetting { key: String, value: String },
}
