//! Per-pipeline processing: next-bucket sequencing, the scan, transform and
//! sink stages of a unit, the tick scheduler, and its task lifecycle.

pub mod lifecycle;
pub mod scan;
pub mod scheduler;
pub mod sequencer;
pub mod sink_writer;
pub mod transform;
