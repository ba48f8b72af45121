pub mod batch_minor_linear;
pub mod expression;
pub mod fuse_activation;
pub mod groups;
pub mod matcher;
pub mod missing_quantization;
pub mod pattern;
pub mod remove_noops;
pub mod remove_reshapes;

pub use groups::{get_fusion, get_fusions, match_group_for};
pub use matcher::{MatchEnv, MatchGroup, Matcher};
