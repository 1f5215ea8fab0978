use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    InvalidShape {
        layer: &'static str,
        got: Vec<usize>,
    },
    Shape(ShapeError),
    MissingCache {
        layer: &'static str,
    },
    InvalidInit(String),
    EmptyBatch,
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::InvalidShape { layer, got } => {
                write!(f, "The {layer} layer can't take an input of shape {got:?}")
            }
            MlErr::Shape(e) => write!(f, "Invalid array shape: {e}"),
            MlErr::MissingCache { layer } => write!(
                f,
                "The {layer} layer was asked to go backward without its forward cache"
            ),
            MlErr::InvalidInit(detail) => {
                write!(f, "Failed to initialize the parameters: {detail}")
            }
            MlErr::EmptyBatch => write!(f, "Received an empty batch"),
        }
    }
}

impl Error for MlErr {}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}
