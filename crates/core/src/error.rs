use std::path::PathBuf;

/// Errors raised while loading, batching, interpolating, or scoring A-Train instances.
///
/// Every variant tied to a single instance carries its id so a failing dataset
/// entry can be located and fixed.
#[derive(thiserror::Error, Debug)]
pub enum AtrainError {
    #[error("instance {instance_id} is not present in the instance index")]
    MissingInstance { instance_id: u32 },

    #[error("label artifact for instance {requested} declares instance id {found}")]
    CorruptLabel { requested: u32, found: u32 },

    #[error("label artifact for instance {instance_id} not found: {}", path.display())]
    MissingLabelFile { instance_id: u32, path: PathBuf },

    #[error("sensor array for instance {instance_id} not found: {}", path.display())]
    MissingSensorFile { instance_id: u32, path: PathBuf },

    #[error("instance {instance_id}: label point {point} has a non-finite coordinate")]
    NonFiniteCoordinate { instance_id: u32, point: usize },

    #[error("{context}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("index {index} is out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("angle index {0} is out of range (expected 0..16)")]
    InvalidAngle(usize),

    #[error("unknown field preset: {0}")]
    UnknownFieldPreset(String),

    #[error("split '{split}' is not defined in {split_name}.json")]
    UnknownSplit { split: String, split_name: String },

    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read sensor array {}: {source}", path.display())]
    Npy {
        path: PathBuf,
        #[source]
        source: ndarray_npy::ReadNpyError,
    },
}

pub type AtrainResult<T> = Result<T, AtrainError>;

impl AtrainError {
    /// Instance id the error is attributed to, if any.
    pub fn instance_id(&self) -> Option<u32> {
        match self {
            Self::MissingInstance { instance_id }
            | Self::MissingLabelFile { instance_id, .. }
            | Self::MissingSensorFile { instance_id, .. }
            | Self::NonFiniteCoordinate { instance_id, .. } => Some(*instance_id),
            Self::CorruptLabel { requested, .. } => Some(*requested),
            _ => None,
        }
    }
}
