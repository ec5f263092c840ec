pub mod envelope;
pub mod time;

pub use envelope::{Envelope, Message, CLOSING_SEQUENCE_ID};
pub use time::{Duration, Time, TimeInterval};
