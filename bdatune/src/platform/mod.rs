//! Capability interfaces of the broadcast pipeline platform.
//!
//! The tuner core never talks to a concrete media framework. Everything it
//! needs from the platform is expressed here as small capability traits:
//!
//! - [`Platform`]: factory for graphs and built-in stages, plus the directories
//! - [`DeviceDirectory`]: enumerates and binds hardware devices per category
//! - [`TuningSpaceDirectory`]: finds, creates and persists tuning spaces
//! - [`DiagnosticRegistry`]: optional registration of graphs for inspection tools
//! - [`Filter`] / [`Pin`] / [`FilterGraph`]: pipeline stages and their connections
//! - [`TuneControl`], [`SampleGrabber`], [`MediaControl`]: per-call-site capabilities
//!
//! [`loopback`] implements all of them in-process.

pub mod loopback;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use bdatune_types::{NetworkStandard, TuneRequest, TuningSpace};

use crate::buffer::Sample;

/// Errors reported by platform collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The requested object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The device is held by another client.
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Two pins refused to connect.
    #[error("Incompatible pins: {0}")]
    Incompatible(String),

    /// The object lacks the requested capability.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Any other platform failure.
    #[error("Platform failure: {0}")]
    Failed(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Device category enumerated by the device directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCategory {
    /// Network tuner devices.
    NetworkTuner,
    /// Receiver components (capture devices).
    ReceiverComponent,
    /// Transport-information filters.
    TransportInformation,
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceCategory::NetworkTuner => "network tuner",
            DeviceCategory::ReceiverComponent => "receiver component",
            DeviceCategory::TransportInformation => "transport information",
        })
    }
}

/// An entry of the device directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub category: DeviceCategory,
    /// Ordinal position in the directory's enumeration order.
    pub index: usize,
    /// Directory-specific device path.
    pub path: String,
}

/// Built-in stages created by the platform rather than discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    NetworkProvider(NetworkStandard),
    SampleGrabber,
    Demultiplexer,
}

/// Identity of a filter instance, unique per platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(pub u64);

/// Identity of a pin instance, unique per platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
}

/// Media shape accepted by the sample grabber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaType {
    pub major: MajorType,
    pub subtype: MediaSubtype,
}

impl MediaType {
    /// MPEG-2 transport stream carried over a generic byte stream.
    pub const TRANSPORT_STREAM: MediaType = MediaType {
        major: MajorType::Stream,
        subtype: MediaSubtype::Mpeg2Transport,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorType {
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSubtype {
    Mpeg2Transport,
}

/// Run state of a filter graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Stopped,
    Paused,
    Running,
}

/// Immediate result of asking a graph to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The graph reached the running state synchronously.
    Running,
    /// The transition continues asynchronously; poll the state.
    Pending,
}

/// Result of one bounded state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateQuery {
    /// The graph finished its transition.
    Settled(GraphState),
    /// The graph is still between states after the poll timeout.
    Intermediate(GraphState),
}

/// Token returned by the diagnostic registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken(pub u32);

/// Receiver of samples delivered by the sample grabber.
///
/// Called on a thread owned by the pipeline runtime.
pub trait SampleSink: Send + Sync {
    fn on_sample(&self, sample: Sample);
}

/// Top-level platform handle.
pub trait Platform: Send + Sync {
    fn devices(&self) -> &dyn DeviceDirectory;

    fn tuning_spaces(&self) -> &dyn TuningSpaceDirectory;

    /// Registry for external inspection tools, when the platform has one.
    fn diagnostics(&self) -> Option<&dyn DiagnosticRegistry>;

    /// Create an empty graph container.
    fn create_graph(&self) -> PlatformResult<Box<dyn FilterGraph>>;

    /// Create a built-in stage.
    fn create_filter(&self, kind: FilterKind) -> PlatformResult<Box<dyn Filter>>;
}

/// Enumerates and binds hardware devices.
pub trait DeviceDirectory: Send + Sync {
    /// Entries of `category` in stable, directory-defined order.
    fn enumerate(&self, category: DeviceCategory) -> PlatformResult<Vec<DeviceHandle>>;

    /// Instantiate the device behind `handle`.
    fn bind(&self, handle: &DeviceHandle) -> PlatformResult<Box<dyn Filter>>;

    fn friendly_name(&self, handle: &DeviceHandle) -> PlatformResult<String>;
}

/// Persistent store of tuning spaces keyed by unique name.
pub trait TuningSpaceDirectory: Send + Sync {
    /// First tuning space of `standard`, restricted to `name` when given.
    fn find(
        &self,
        standard: NetworkStandard,
        name: Option<&str>,
    ) -> PlatformResult<Option<TuningSpace>>;

    /// Create and register a tuning space.
    fn create(&self, standard: NetworkStandard, name: &str) -> PlatformResult<TuningSpace>;

    /// Write `space` back under its unique name.
    fn persist(&self, space: &TuningSpace) -> PlatformResult<()>;
}

/// Registry of running graphs for external inspection tools.
pub trait DiagnosticRegistry: Send + Sync {
    fn register(&self, display_name: &str) -> PlatformResult<RegistrationToken>;

    fn revoke(&self, token: RegistrationToken) -> PlatformResult<()>;
}

/// One pipeline stage instance. Dropping it releases the stage.
pub trait Filter: Send {
    fn id(&self) -> FilterId;

    /// Pins in enumeration order.
    fn pins(&self) -> PlatformResult<Vec<Box<dyn Pin>>>;

    /// Tune-request capability of a network provider.
    fn tune_control(&mut self) -> Option<&mut dyn TuneControl> {
        None
    }

    /// Sample-grabber capability.
    fn sample_grabber(&mut self) -> Option<&mut dyn SampleGrabber> {
        None
    }
}

/// Pin handle; released when dropped.
pub trait Pin: Send {
    fn id(&self) -> PinId;

    fn direction(&self) -> PlatformResult<PinDirection>;

    fn is_connected(&self) -> PlatformResult<bool>;
}

/// Container of stages and their connections.
pub trait FilterGraph: Send {
    /// Name used when registering the graph for diagnostics.
    fn display_name(&self) -> String;

    fn add_filter(&mut self, filter: &dyn Filter, name: &str) -> PlatformResult<()>;

    /// Remove `filter`, breaking its connections.
    fn remove_filter(&mut self, filter: &dyn Filter) -> PlatformResult<()>;

    /// Connect two pins without inserting intermediate stages.
    fn connect_direct(&mut self, output: &dyn Pin, input: &dyn Pin) -> PlatformResult<()>;

    /// Start/stop control for the assembled graph.
    fn media_control(&mut self) -> PlatformResult<Box<dyn MediaControl>>;
}

/// Start/stop control handle of a graph.
pub trait MediaControl: Send {
    fn run(&mut self) -> PlatformResult<RunOutcome>;

    /// Wait up to `timeout` for a pending transition.
    fn state(&mut self, timeout: Duration) -> PlatformResult<StateQuery>;

    fn stop(&mut self) -> PlatformResult<()>;
}

/// Tune-request handling of a network provider.
pub trait TuneControl {
    fn validate(&self, request: &TuneRequest) -> PlatformResult<()>;

    fn put_tune_request(&mut self, request: &TuneRequest) -> PlatformResult<()>;
}

/// Configuration of a sample-grabber stage.
pub trait SampleGrabber {
    fn set_media_type(&mut self, media_type: MediaType) -> PlatformResult<()>;

    fn set_buffer_samples(&mut self, enabled: bool) -> PlatformResult<()>;

    fn set_one_shot(&mut self, one_shot: bool) -> PlatformResult<()>;

    fn set_callback(&mut self, sink: Arc<dyn SampleSink>) -> PlatformResult<()>;
}
