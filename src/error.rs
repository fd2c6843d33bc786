use thiserror::Error;

/// Fatal compiler errors. All of these abort the run with a one-line
/// diagnostic naming the offending layer and the bound that failed.
#[derive(Error, Debug)]
pub enum CompilerError {
    #[error("layer {layer}: shape mismatch: {reason}")]
    ShapeMismatch { layer: String, reason: String },

    #[error("layer {layer}: no segmentation satisfies the hardware constraints ({reason})")]
    CapacityOverflow { layer: String, reason: String },

    #[error("static memory layout failed: {0}")]
    MemoryOverflow(String),

    #[error("layer {layer}: weight file '{path}': {reason}")]
    WeightIo {
        layer: String,
        path: String,
        reason: String,
    },

    #[error("segmentation cache '{path}': {reason}")]
    CacheInvalid { path: String, reason: String },

    #[error("layer {layer}: {field} = {value} exceeds {bits} bit record field")]
    BitWidthOverflow {
        layer: String,
        field: &'static str,
        value: i64,
        bits: u32,
    },

    #[error("layer {layer}: {reason}")]
    Unsupported { layer: String, reason: String },

    #[error("export '{path}' failed: {source}")]
    Export {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown net '{0}'")]
    UnknownNet(String),
}

pub type Result<T> = std::result::Result<T, CompilerError>;
