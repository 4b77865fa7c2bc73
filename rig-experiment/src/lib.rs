pub mod barrier;
pub mod config;
pub mod events;
pub mod iti;
pub mod maintenance;
pub mod plan;
pub mod sensor;
pub mod sequencer;
pub mod session;
pub mod state;

pub use barrier::{BarrierError, OnsetBarrier};
pub use config::{SessionConfig, SessionSetup, SessionTiming};
pub use events::{CsvSink, EventLog, EventSink, JsonLinesSink, MemorySink, NullSink};
pub use iti::{ItiDraw, ItiRegime, ItiSchedule};
pub use plan::TrialPlan;
pub use sensor::{PokeWait, SensorLine, SensorPoller};
pub use sequencer::{ActuatorSequencer, SyncReport};
pub use session::{EndReason, SessionController, SessionSummary};
pub use state::{Interrupted, TrialStateMachine};
