//! Delivery of display output to the embedding host.

pub mod frame;
pub mod output;

pub use frame::{Frame, FrameDelivery, FrameEvent};
pub use output::{
    ConsumerEvent, ConsumerSink, CursorCallback, FrameCallback, NoticeCallback, OutputWorker, SessionNotice,
};
