//! Flag parsing and mode resolution.

use std::path::PathBuf;
use structopt::StructOpt;
use xfeat_nets::Normalization;

#[derive(Debug, StructOpt)]
#[structopt(name = "xfeat-export", about = "Export XFeat/matching models to ONNX.")]
pub struct Opts {
    /// Export only the single-scale extractor.
    #[structopt(long)]
    pub extractor_only: bool,

    /// Export only the dual-scale dense extractor.
    #[structopt(long)]
    pub extractor_dualscale: bool,

    /// Export only the coarse-to-fine matcher.
    #[structopt(long)]
    pub matcher_only: bool,

    /// Spell instance normalization out as (x - mean) / (std + epsilon),
    /// for inference libraries without InstanceNorm support.
    #[structopt(long)]
    pub split_instance_norm: bool,

    /// Input image height.
    #[structopt(long, default_value = "640")]
    pub height: i64,

    /// Input image width.
    #[structopt(long, default_value = "640")]
    pub width: i64,

    /// Keep best k features.
    #[structopt(long, default_value = "100")]
    pub top_k: i64,

    /// Enable dynamic axes.
    #[structopt(long)]
    pub dynamic: bool,

    /// Path to export the ONNX model to.
    #[structopt(long, default_value = "onnx_weights/extractor.onnx")]
    pub export_path: PathBuf,

    /// ONNX opset version (the full pipeline ignores this and pins its own).
    #[structopt(long, default_value = "11")]
    pub opset: i64,

    #[structopt(short = "v", parse(from_occurrences))]
    pub verbosity: usize,
}

/// The four export variants. The flags are not validated for exclusivity;
/// the first raised flag wins in declaration order, and none raised is the
/// full matching pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportMode {
    Extractor,
    Dualscale,
    Matcher,
    FullPipeline,
}

impl ExportMode {
    pub fn resolve(opts: &Opts) -> ExportMode {
        if opts.extractor_only {
            ExportMode::Extractor
        } else if opts.extractor_dualscale {
            ExportMode::Dualscale
        } else if opts.matcher_only {
            ExportMode::Matcher
        } else {
            ExportMode::FullPipeline
        }
    }
}

/// Everything the export pipeline needs, resolved once per invocation.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub mode: ExportMode,
    pub height: i64,
    pub width: i64,
    pub top_k: i64,
    pub dynamic: bool,
    pub normalization: Normalization,
    pub export_path: PathBuf,
    pub opset: i64,
}

impl ExportConfig {
    pub fn resolve(opts: Opts) -> ExportConfig {
        let mode = ExportMode::resolve(&opts);
        if let Some(text) = topk_warning(opts.top_k) {
            warn!("{text}");
        }
        let normalization = if opts.split_instance_norm {
            Normalization::split()
        } else {
            Normalization::Fused
        };
        ExportConfig {
            mode,
            height: opts.height,
            width: opts.width,
            top_k: opts.top_k,
            dynamic: opts.dynamic,
            normalization,
            export_path: opts.export_path,
            opset: opts.opset,
        }
    }
}

/// Emitted once at resolution when top_k exceeds the default dual-scale
/// budget; 4800 * 0.8 keypoints on the large scale is exactly TensorRT's
/// TopK ceiling.
pub fn topk_warning(top_k: i64) -> Option<String> {
    (top_k > 4800).then(|| {
        format!(
            "top_k is {top_k}: the current maximum supported value for TopK in TensorRT \
             is 3840, which coincidentally equals 4800 * 0.8. Please ignore this warning \
             if TensorRT will not be used in the future."
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(args: &[&str]) -> Opts {
        let argv: Vec<&str> = std::iter::once("xfeat-export").chain(args.iter().copied()).collect();
        Opts::from_iter_safe(argv).unwrap()
    }

    #[test]
    fn defaults_match_the_published_tool() {
        let o = opts(&[]);
        assert_eq!(o.height, 640);
        assert_eq!(o.width, 640);
        assert_eq!(o.top_k, 100);
        assert_eq!(o.opset, 11);
        assert!(!o.dynamic);
        assert!(!o.split_instance_norm);
        assert_eq!(o.export_path, PathBuf::from("onnx_weights/extractor.onnx"));
        assert_eq!(ExportMode::resolve(&o), ExportMode::FullPipeline);
    }

    #[test]
    fn first_raised_flag_wins() {
        let o = opts(&["--extractor-only", "--extractor-dualscale", "--matcher-only"]);
        assert_eq!(ExportMode::resolve(&o), ExportMode::Extractor);
        let o = opts(&["--extractor-dualscale", "--matcher-only"]);
        assert_eq!(ExportMode::resolve(&o), ExportMode::Dualscale);
        let o = opts(&["--matcher-only"]);
        assert_eq!(ExportMode::resolve(&o), ExportMode::Matcher);
    }

    #[test]
    fn numeric_flags_parse() {
        let o = opts(&["--height", "480", "--width", "320", "--top-k", "4096", "--opset", "17"]);
        assert_eq!((o.height, o.width, o.top_k, o.opset), (480, 320, 4096, 17));
    }

    #[test]
    fn topk_warning_fires_above_4800_only() {
        assert!(topk_warning(100).is_none());
        assert!(topk_warning(4800).is_none());
        let text = topk_warning(4801).unwrap();
        assert!(text.contains("3840"), "{text}");
        assert!(text.contains("4800 * 0.8"), "{text}");
    }

    #[test]
    fn split_flag_selects_the_split_policy() {
        let config = ExportConfig::resolve(opts(&["--split-instance-norm"]));
        assert_eq!(config.normalization, Normalization::split());
        let config = ExportConfig::resolve(opts(&[]));
        assert_eq!(config.normalization, Normalization::Fused);
    }
}
