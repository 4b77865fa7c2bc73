pub mod actuator;
pub mod error;
pub mod event;
pub mod io;
pub mod mock;
pub mod protocol;
pub mod sysfs;
pub mod trial;

pub use actuator::{Actuator, DeliveryStep, Stimulus};
pub use error::{HardwareError, RigError, RigResult};
pub use event::EventLogEntry;
pub use io::{Channel, DigitalIo, Direction, Level, Polarity};
pub use mock::MockGateway;
pub use protocol::{Protocol, ProtocolKind};
pub use sysfs::SysfsGateway;
pub use trial::{TrialOutcome, TrialRecord, TrialState};
