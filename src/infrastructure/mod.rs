pub mod event_bus;
pub mod quota;

pub use event_bus::{EventBus, EventStream};
pub use quota::{QuotaManager, QuotaRecord, QuotaStatus};
