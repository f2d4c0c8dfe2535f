//! Protobuf types for the ONNX exchange format, generated by prost.
//!
//! The schema is trimmed to the subset this tool reads and writes: no
//! training information, functions, sparse tensors or external data.

include!("prost/onnx.rs");
