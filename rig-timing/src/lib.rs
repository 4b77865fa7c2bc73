pub mod cancel;
pub mod clock;
pub mod interval;
pub mod stats;
pub mod wait;

pub use cancel::CancelToken;
pub use clock::{Clock, HighPrecisionClock, ManualClock};
pub use interval::{HoldTracker, ResettableInterval};
pub use stats::{PollStats, PollSummary};
pub use wait::{sleep_for, Interrupt, Waiter};
