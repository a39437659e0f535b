pub mod metrics;
pub mod trace;
pub mod tracing;

pub use self::metrics::{LatencyHistogram, MetricsRegistry, TimingGuard};
pub use self::trace::{TraceContext, TraceScope};
pub use self::tracing::init_tracing;
