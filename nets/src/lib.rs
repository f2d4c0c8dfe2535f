//! Graph definitions for the XFeat exporter.
//!
//! Every export variant is built directly as an ONNX graph: there is no
//! runtime model to trace, so each variant is a closed, explicitly tagged
//! construction. Parameter tensors are synthesized placeholders (see
//! [`params`]); what the exporter guarantees is the structure of the graph,
//! its operator set and its input/output contract, not trained weights.
//!
//! * [`backbone`]: the single-scale extractor (`feats`, `keypoints`,
//!   `heatmaps`).
//! * [`dense`]: the dual-scale dense extractor (`mkpts`, `feats`, `sc`).
//! * [`matcher`]: coarse-to-fine matching over pre-extracted features
//!   (`matches`, `batch_indexes`).
//! * [`lighterglue`]: the full attention-based matching pipeline.

#[macro_use]
extern crate log;

pub mod backbone;
pub mod dense;
pub mod lighterglue;
pub mod matcher;
pub mod norm;
pub mod params;

pub use self::backbone::ExtractorGraph;
pub use self::dense::DenseGraph;
pub use self::lighterglue::LighterGlueGraph;
pub use self::matcher::MatcherGraph;
pub use self::norm::Normalization;
pub use self::params::ParamSynth;

/// Descriptor width shared by every variant.
pub const DESCRIPTOR_DIM: i64 = 64;
