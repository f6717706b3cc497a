//! Rate limiting logic and state management.

mod counter;
mod escalation;
mod limiter;
mod policy;
mod scheduler;

pub use counter::{CounterRecord, CounterStore, Leak, LeakStats};
pub use escalation::{EscalationTracker, InMemoryEscalation};
pub use limiter::{Decision, Limiter, LimiterBuilder};
pub use policy::{Policy, PolicyError, TimeWindow};
pub use scheduler::{ManualScheduler, ScheduleError, Scheduler, Task, TokioScheduler};
