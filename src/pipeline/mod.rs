//! Turn-to-reply pipeline: turn aggregation, sentence segmentation and the
//! generation coordinator.

pub mod coordinator;
pub mod messages;
pub mod segmenter;
pub mod turns;
