//! Stage-weighted completion ratios.
//!
//! All pipelines report through this mapping so callers see comparable
//! numbers: preparing covers [0, 0.4], transcoding [0.4, 0.9], and
//! finalization [0.9, 1.0].

use crate::callback::TranscodeStatus;

const PREPARING_END: f64 = 0.4;
const TRANSCODING_END: f64 = 0.9;

/// Map a within-stage ratio in [0, 1] to the job-wide completion ratio.
pub fn overall_completion_ratio(status: TranscodeStatus, stage_ratio: f64) -> f64 {
    let stage_ratio = stage_ratio.clamp(0.0, 1.0);
    match status {
        TranscodeStatus::Preparing => scale(stage_ratio, 0.0, PREPARING_END),
        TranscodeStatus::PreparingCompleted => PREPARING_END,
        TranscodeStatus::Transcoding => scale(stage_ratio, PREPARING_END, TRANSCODING_END),
        TranscodeStatus::Completed => 1.0,
        // Terminal errors keep whatever progress was last reported.
        TranscodeStatus::Error => scale(stage_ratio, 0.0, 1.0),
    }
}

fn scale(ratio: f64, from: f64, to: f64) -> f64 {
    from + ratio * (to - from)
}
