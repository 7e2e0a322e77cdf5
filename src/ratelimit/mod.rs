//! Admission control logic and window state management.

pub mod clock;
pub mod decision;
pub mod identifier;
pub mod introspection;
mod limiter;
pub mod policy;
pub mod store;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, RateLimitInfo, Rejection, SkipReason};
pub use identifier::{CallerIdentity, Identifier, IdentifierKind, IdentifierStrategy, RequestOrigin};
pub use introspection::{GlobalStats, UsageReport, UsageService};
pub use limiter::{AdmissionEngine, DEFAULT_OPERATION_TIMEOUT};
pub use policy::{Policy, PolicyCatalog, PolicyConfig};
pub use store::{MemoryStore, RetentionSweeper, StoreError, StoreSummary, WindowStore};
pub use window::UsageWindow;
