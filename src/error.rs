use thiserror::Error;

/// Every failure the training core can report. None of these are recovered
/// locally: they propagate to the training loop driver, which terminates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("layer graph stage `{stage}`: {reason}")]
    Graph { stage: String, reason: String },

    #[error("{role} has shape {actual:?}, expected {expected}")]
    Shape {
        role: String,
        expected: String,
        actual: Vec<i64>,
    },

    #[error("non-finite loss {name} = {value}")]
    NonFiniteLoss { name: String, value: f64 },

    #[error("non-finite gradient in {model} parameter `{param}`")]
    NonFiniteGradient { model: String, param: String },

    #[error("data source `{name}`: {reason}")]
    DataSource { name: String, reason: String },

    #[error("checkpoint does not match the configured architecture:\n  {}", .0.join("\n  "))]
    CheckpointMismatch(Vec<String>),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Gif(#[from] gif::EncodingError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(role: impl Into<String>, expected: impl Into<String>, actual: Vec<i64>) -> Self {
        Error::Shape {
            role: role.into(),
            expected: expected.into(),
            actual,
        }
    }
}
