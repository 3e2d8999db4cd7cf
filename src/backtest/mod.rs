pub mod aggregator;
pub mod events;
pub mod time_frame;
pub mod timeline;

pub use events::{StreamKind, StreamMessage};
pub use time_frame::TimeFrame;
pub use timeline::{BacktestRequest, BacktestTimeline, ReplayState, TimelineStatus};
