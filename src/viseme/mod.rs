//! Viseme shape tables and timelines for lip-sync animation.
//!
//! A viseme is the visual mouth shape for one or more phonemes. This module
//! resolves phoneme and group labels to facial-control weights and lays
//! them out on a per-utterance timeline.

pub mod shapes;
pub mod timeline;
pub mod timing;

pub use shapes::{ShapeKey, ShapeTable, ShapeWeights, VisemeCategory};
pub use timeline::{
    FlatViseme, GroupedViseme, Timeline, TimelineBuilder, TimelineEvent, TimelineInput,
    TimelineSource,
};
