//! Construction, serialization and structural validation of ONNX models.
//!
//! This crate is the format layer of the XFeat exporter. It knows nothing
//! about feature extraction: it provides the protobuf schema ([`pb`]), a
//! direct graph builder ([`builder`]), tensor payload conversions
//! ([`tensor`]), a structural checker ([`checker`]) and optional
//! post-processing passes ([`optim`]). Network definitions live in
//! `xfeat-nets`, the command line in `xfeat-export`.

#[macro_use]
extern crate log;

pub mod builder;
pub mod checker;
pub mod model;
pub mod optim;
pub mod pb;
pub mod pb_helpers;
pub mod tensor;

pub use self::model::for_path;
pub use self::model::for_reader;
pub use self::model::save;

/// This crate's error and result types are anyhow's.
pub type XfeatResult<T> = anyhow::Result<T>;

pub type TVec<T> = smallvec::SmallVec<[T; 4]>;

pub use anyhow;

#[macro_export]
macro_rules! tvec {
    // count helper: transform any expression into 1
    (@one $x:expr) => (1usize);
    ($elem:expr; $n:expr) => ({
        $crate::TVec::from_elem($elem, $n)
    });
    ($($x:expr),*$(,)*) => ({
        let count = 0usize $(+ tvec!(@one $x))*;
        #[allow(unused_mut)]
        let mut vec = $crate::TVec::new();
        if count <= vec.inline_size() {
            $(vec.push($x);)*
            vec
        } else {
            $crate::TVec::from_vec(vec![$($x,)*])
        }
    });
}

/// Common imports for crates building graphs with xfeat-onnx.
pub mod prelude {
    pub use crate::builder::{Dim, GraphBuilder, Wire, fixed};
    pub use crate::pb;
    pub use crate::pb::tensor_proto::DataType;
    pub use crate::{TVec, XfeatResult, tvec};
}

/// Wider imports for this crate and the network definitions.
pub mod internal {
    pub use crate::prelude::*;
    pub use crate::{pb_helpers, tensor};
    pub use anyhow::{Context, bail, ensure, format_err};
}
