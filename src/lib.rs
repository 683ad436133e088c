//! profrelay: an application profiler and structured log shipper.
//!
//! Application code opens and closes [`profiling::Hit`]s against a
//! [`profiling::Profiler`], which forwards finished hits to a
//! [`collector::Collector`] -- either an in-process [`collector::local::LocalCollector`]
//! writing through a [`logger::Logger`] (console or rotating/archiving
//! files), or an [`collector::http_proxy::HttpProxyCollector`] shipping to a
//! remote [`aggregator::AggregatorServer`]. Runtime behavior (enabled state,
//! sort column, verbosity, logger paths) is driven by either a local
//! sentinel-file/JSON-file pair ([`config::local::RuntimeConfigurator`]) or
//! configuration deltas pushed over HTTP ([`config::remote::RemoteRuntimeConfigurator`]).

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod error;
pub mod logger;
pub mod machine;
pub mod profiling;

pub use error::{Error, Result};
