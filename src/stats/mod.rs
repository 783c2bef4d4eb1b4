// Stats module - Host sampling, history and threshold alerting

pub mod alerts;
pub mod collector;
pub mod probe;

pub use alerts::{AlertEngine, NewAlert, Raised};
pub use collector::{CollectorMetrics, MonitoringUpdate, StatsCollector, TickOutcome, TickSummary};
pub use probe::{HostProbe, HostSnapshot, SysinfoProbe};
