//! Hit-point timing: open/close events folded into per-target aggregates.

pub mod hit;
pub mod profiler;
pub mod target;

pub use hit::Hit;
pub use profiler::Profiler;
pub use target::{ProfilerTarget, Stats};
