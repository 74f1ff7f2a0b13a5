//! Slider CAPTCHA solving: gap estimation, attempt bookkeeping and human annotation.

mod estimator;
mod solver;
mod training;

pub use estimator::{GapEstimate, GapEstimator, TemplateMatchEstimator, OPAQUE_ALPHA};
pub use solver::{CaptchaSolver, ChallengeImage};
pub use training::{TrainingService, DEFAULT_TOLERANCE_PX};

pub const CRATE_NAME: &str = "scout-captcha";
