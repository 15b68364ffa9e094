//! Anti-spoofing hook.
//!
//! No liveness algorithm ships with the pipeline. [`PassThroughLiveness`]
//! reports every face as not evaluated; deployments that need spoof
//! resistance plug their own [`LivenessCheck`] into the pipeline.

use serde::Serialize;

use crate::faces::detector::FaceRegion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum LivenessVerdict {
    Live,
    Spoof(String),
    NotEvaluated,
}

impl LivenessVerdict {
    pub fn is_spoof(&self) -> bool {
        matches!(self, LivenessVerdict::Spoof(_))
    }
}

pub trait LivenessCheck: Send + Sync {
    fn assess(&self, face: &FaceRegion) -> LivenessVerdict;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughLiveness;

impl LivenessCheck for PassThroughLiveness {
    fn assess(&self, _face: &FaceRegion) -> LivenessVerdict {
        LivenessVerdict::NotEvaluated
    }
}
