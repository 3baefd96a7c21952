//! Filter graph assembly and teardown.
//!
//! A graph is built in a fixed order:
//!
//! ```text
//! network provider -> tuner -> [capture] -> sample grabber -> demultiplexer -> transport information
//! ```
//!
//! The graph is either fully built or absent. A failed build releases every
//! stage created so far before returning, and every build starts with a full
//! teardown of the previous graph.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use bdatune_types::{TuneRequest, TuningSpace};

use crate::buffer::SampleBuffer;
use crate::device::{discover, DeviceCursor, DiscoveredDevice, DiscoveryError, DiscoveryPolicy};
use crate::pin::{self, ConnectError};
use crate::platform::{
    DeviceCategory, DeviceHandle, Filter, FilterGraph, FilterKind, MediaControl, MediaType,
    Platform, PlatformError, RegistrationToken, SampleSink,
};

/// Position of a stage in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageRole {
    NetworkProvider,
    Tuner,
    Capture,
    SampleGrabber,
    Demultiplexer,
    TransportInformation,
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageRole::NetworkProvider => "network provider",
            StageRole::Tuner => "tuner",
            StageRole::Capture => "capture device",
            StageRole::SampleGrabber => "sample grabber",
            StageRole::Demultiplexer => "demultiplexer",
            StageRole::TransportInformation => "transport information filter",
        })
    }
}

/// Graph build errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The active tuning space could not be written back.
    #[error("Cannot persist tuning space '{name}': {source}")]
    PersistTuningSpace {
        name: String,
        #[source]
        source: PlatformError,
    },

    /// The graph container or its control handle could not be obtained.
    #[error("Graph unavailable: {0}")]
    Graph(#[source] PlatformError),

    /// A built-in stage could not be created, added or configured.
    #[error("Cannot set up {role}: {source}")]
    Stage {
        role: StageRole,
        #[source]
        source: PlatformError,
    },

    /// The network provider refused the tune request.
    #[error("Tune request rejected: {0}")]
    TuneRequest(#[source] PlatformError),

    /// The offered tuner did not connect to the network provider.
    #[error("Tuner '{device}' cannot be connected: {source}")]
    TunerRejected {
        device: String,
        #[source]
        source: ConnectError,
    },

    /// Every tuner device has been tried.
    #[error("No tuner device left ({tried} tried in this build)")]
    NoTuner { tried: usize },

    /// A discovered stage could not be found or handled.
    #[error("Cannot discover {role}: {source}")]
    Discovery {
        role: StageRole,
        #[source]
        source: DiscoveryError,
    },

    /// Two built-in stages could not be connected.
    #[error("Cannot connect {role}: {source}")]
    Connect {
        role: StageRole,
        #[source]
        source: ConnectError,
    },
}

impl BuildError {
    /// Whether rebuilding with the next tuner may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BuildError::TunerRejected { .. })
    }

    /// Stage the failure belongs to, if any.
    pub fn stage(&self) -> Option<StageRole> {
        match self {
            BuildError::Stage { role, .. }
            | BuildError::Discovery { role, .. }
            | BuildError::Connect { role, .. } => Some(*role),
            BuildError::TuneRequest(_) => Some(StageRole::NetworkProvider),
            BuildError::TunerRejected { .. } | BuildError::NoTuner { .. } => Some(StageRole::Tuner),
            BuildError::PersistTuningSpace { .. } | BuildError::Graph(_) => None,
        }
    }
}

/// One node of a built graph.
///
/// A `Stage` only exists once its filter is bound, added to the graph and
/// connected in build order. Unbound and bound-but-unconnected
/// stages live as locals of the build and are released when it fails, so
/// every reachable `Stage` is connected to its neighbours.
pub struct Stage {
    role: StageRole,
    name: String,
    device: Option<DeviceHandle>,
    filter: Box<dyn Filter>,
}

impl Stage {
    fn builtin(role: StageRole, name: &str, filter: Box<dyn Filter>) -> Self {
        Self {
            role,
            name: name.to_string(),
            device: None,
            filter,
        }
    }

    fn discovered(role: StageRole, found: DiscoveredDevice) -> Self {
        Self {
            role,
            name: found.friendly_name,
            device: Some(found.handle),
            filter: found.filter,
        }
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device the stage is bound to; `None` for built-in stages.
    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("role", &self.role)
            .field("name", &self.name)
            .field("device", &self.device)
            .finish()
    }
}

/// A fully built graph. Fields are released by [`GraphBuilder::teardown`].
struct Assembled {
    graph: Box<dyn FilterGraph>,
    control: Box<dyn MediaControl>,
    registration: Option<RegistrationToken>,
    network_provider: Stage,
    tuner: Stage,
    /// `None` when the tuner doubles as the capture stage.
    capture: Option<Stage>,
    grabber: Stage,
    demultiplexer: Stage,
    transport_information: Stage,
}

/// Builds, owns and tears down the filter graph.
pub struct GraphBuilder {
    platform: Arc<dyn Platform>,
    buffer: Arc<SampleBuffer>,
    register_diagnostics: bool,
    cursor: DeviceCursor,
    assembled: Option<Assembled>,
}

impl GraphBuilder {
    pub fn new(
        platform: Arc<dyn Platform>,
        buffer: Arc<SampleBuffer>,
        register_diagnostics: bool,
    ) -> Self {
        Self {
            platform,
            buffer,
            register_diagnostics,
            cursor: DeviceCursor::new(),
            assembled: None,
        }
    }

    pub fn is_built(&self) -> bool {
        self.assembled.is_some()
    }

    /// Tuner enumeration progress.
    pub fn cursor(&self) -> &DeviceCursor {
        &self.cursor
    }

    /// Start tuner discovery from the first device again.
    pub fn reset_cursor(&mut self) {
        self.cursor.reset();
    }

    /// Stages of the built graph in build order.
    pub fn stages(&self) -> Vec<&Stage> {
        let Some(a) = self.assembled.as_ref() else {
            return Vec::new();
        };
        let mut stages = vec![&a.network_provider, &a.tuner];
        stages.extend(a.capture.as_ref());
        stages.extend([&a.grabber, &a.demultiplexer, &a.transport_information]);
        stages
    }

    /// Whether the tuner also acts as the capture stage.
    pub fn capture_is_tuner(&self) -> bool {
        self.assembled.as_ref().is_some_and(|a| a.capture.is_none())
    }

    pub fn registration(&self) -> Option<RegistrationToken> {
        self.assembled.as_ref().and_then(|a| a.registration)
    }

    /// Start/stop control of the built graph.
    pub fn media_control(&mut self) -> Option<&mut dyn MediaControl> {
        match self.assembled.as_mut() {
            Some(a) => Some(a.control.as_mut()),
            None => None,
        }
    }

    /// Tear down any previous graph and build a new one for `request`.
    pub fn build(&mut self, space: &TuningSpace, request: &TuneRequest) -> Result<(), BuildError> {
        self.platform
            .tuning_spaces()
            .persist(space)
            .map_err(|source| {
                warn!("[Graph] Cannot persist tuning space '{}': {}", space.unique_name, source);
                BuildError::PersistTuningSpace {
                    name: space.unique_name.clone(),
                    source,
                }
            })?;

        self.teardown();

        match self.assemble(request) {
            Ok(assembled) => {
                info!(
                    "[Graph] Built {} graph: tuner '{}'{}",
                    request.standard(),
                    assembled.tuner.name,
                    assembled
                        .capture
                        .as_ref()
                        .map(|c| format!(", capture '{}'", c.name))
                        .unwrap_or_default()
                );
                self.assembled = Some(assembled);
                Ok(())
            }
            Err(e) => {
                warn!("[Graph] Build failed: {}", e);
                Err(e)
            }
        }
    }

    /// Create and connect every stage.
    ///
    /// Locals drop in reverse declaration order, so an early return releases
    /// the stages built so far in reverse build order and the graph last.
    fn assemble(&mut self, request: &TuneRequest) -> Result<Assembled, BuildError> {
        let platform = Arc::clone(&self.platform);
        let mut graph = platform.create_graph().map_err(BuildError::Graph)?;

        // Network provider carrying the tune request.
        let standard = request.standard();
        let mut provider = builtin(
            platform.as_ref(),
            graph.as_mut(),
            StageRole::NetworkProvider,
            FilterKind::NetworkProvider(standard),
            standard.provider_name(),
        )?;
        let tune = provider.filter.tune_control().ok_or_else(|| {
            BuildError::TuneRequest(PlatformError::Unsupported(
                "network provider has no tune control".into(),
            ))
        })?;
        tune.validate(request)
            .and_then(|()| tune.put_tune_request(request))
            .map_err(BuildError::TuneRequest)?;
        debug!("[Graph] Tune request attached to {}", provider.name);

        // Tuner: only the next candidate, the caller drives retries.
        let tuner = match discover(
            platform.devices(),
            &mut self.cursor,
            DeviceCategory::NetworkTuner,
            graph.as_mut(),
            provider.filter.as_ref(),
            DiscoveryPolicy::NextCandidate,
        ) {
            Ok(found) => Stage::discovered(StageRole::Tuner, found),
            Err(DiscoveryError::Rejected { device, source }) => {
                return Err(BuildError::TunerRejected { device, source })
            }
            Err(DiscoveryError::Exhausted { tried, .. }) => {
                return Err(BuildError::NoTuner { tried })
            }
            Err(source) => {
                return Err(BuildError::Discovery {
                    role: StageRole::Tuner,
                    source,
                })
            }
        };

        // Capture device, matched against the selected tuner from the first device on.
        let capture = match discover(
            platform.devices(),
            &mut DeviceCursor::new(),
            DeviceCategory::ReceiverComponent,
            graph.as_mut(),
            tuner.filter.as_ref(),
            DiscoveryPolicy::Scan,
        ) {
            Ok(found) => Some(Stage::discovered(StageRole::Capture, found)),
            Err(DiscoveryError::Exhausted { .. }) => {
                info!("[Graph] No capture device; using tuner '{}' as capture stage", tuner.name);
                None
            }
            Err(source) => {
                return Err(BuildError::Discovery {
                    role: StageRole::Capture,
                    source,
                })
            }
        };
        let capture_filter = capture.as_ref().unwrap_or(&tuner).filter.as_ref();

        let mut grabber = builtin(
            platform.as_ref(),
            graph.as_mut(),
            StageRole::SampleGrabber,
            FilterKind::SampleGrabber,
            "Sample Grabber",
        )?;
        configure(&mut grabber, |g| g.set_media_type(MediaType::TRANSPORT_STREAM))?;
        pin::connect(graph.as_mut(), capture_filter, grabber.filter.as_ref()).map_err(|source| {
            BuildError::Connect {
                role: StageRole::SampleGrabber,
                source,
            }
        })?;

        let demultiplexer = builtin(
            platform.as_ref(),
            graph.as_mut(),
            StageRole::Demultiplexer,
            FilterKind::Demultiplexer,
            "MPEG-2 Demultiplexer",
        )?;
        pin::connect(
            graph.as_mut(),
            grabber.filter.as_ref(),
            demultiplexer.filter.as_ref(),
        )
        .map_err(|source| BuildError::Connect {
            role: StageRole::Demultiplexer,
            source,
        })?;

        let transport_information = discover(
            platform.devices(),
            &mut DeviceCursor::new(),
            DeviceCategory::TransportInformation,
            graph.as_mut(),
            demultiplexer.filter.as_ref(),
            DiscoveryPolicy::Scan,
        )
        .map(|found| Stage::discovered(StageRole::TransportInformation, found))
        .map_err(|source| BuildError::Discovery {
            role: StageRole::TransportInformation,
            source,
        })?;

        // Continuous delivery into the sample buffer.
        let sink: Arc<dyn SampleSink> = self.buffer.clone();
        configure(&mut grabber, |g| {
            g.set_one_shot(false)?;
            g.set_buffer_samples(true)?;
            g.set_callback(sink)
        })?;

        let registration = if self.register_diagnostics {
            register_diagnostics(platform.as_ref(), graph.as_ref())
        } else {
            None
        };

        let control = match graph.media_control() {
            Ok(control) => control,
            Err(source) => {
                revoke_diagnostics(platform.as_ref(), registration);
                return Err(BuildError::Graph(source));
            }
        };

        Ok(Assembled {
            graph,
            control,
            registration,
            network_provider: provider,
            tuner,
            capture,
            grabber,
            demultiplexer,
            transport_information,
        })
    }

    /// Stop and release the graph. Safe to call repeatedly.
    ///
    /// Stages are released in reverse build order, then the control handle,
    /// the graph and its diagnostic registration. Queued samples are discarded.
    pub fn teardown(&mut self) {
        let Some(Assembled {
            graph,
            mut control,
            registration,
            network_provider,
            tuner,
            capture,
            grabber,
            demultiplexer,
            transport_information,
        }) = self.assembled.take()
        else {
            return;
        };

        if let Err(e) = control.stop() {
            warn!("[Graph] Stop failed: {}", e);
        }

        drop(transport_information);
        drop(demultiplexer);
        drop(grabber);
        drop(capture);
        drop(tuner);
        drop(network_provider);
        drop(control);
        drop(graph);
        revoke_diagnostics(self.platform.as_ref(), registration);

        self.buffer.clear();
        debug!("[Graph] Torn down");
    }
}

impl Drop for GraphBuilder {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn builtin(
    platform: &dyn Platform,
    graph: &mut dyn FilterGraph,
    role: StageRole,
    kind: FilterKind,
    name: &str,
) -> Result<Stage, BuildError> {
    let filter = platform.create_filter(kind).map_err(|source| {
        warn!("[Graph] Cannot create {}: {}", role, source);
        BuildError::Stage { role, source }
    })?;
    graph.add_filter(filter.as_ref(), name).map_err(|source| {
        warn!("[Graph] Cannot add {} to the graph: {}", role, source);
        BuildError::Stage { role, source }
    })?;
    Ok(Stage::builtin(role, name, filter))
}

fn configure(
    stage: &mut Stage,
    apply: impl FnOnce(&mut dyn crate::platform::SampleGrabber) -> Result<(), PlatformError>,
) -> Result<(), BuildError> {
    let role = stage.role;
    let grabber = stage.filter.sample_grabber().ok_or_else(|| BuildError::Stage {
        role,
        source: PlatformError::Unsupported("no sample grabber interface".into()),
    })?;
    apply(grabber).map_err(|source| {
        warn!("[Graph] Cannot configure {}: {}", role, source);
        BuildError::Stage { role, source }
    })
}

fn register_diagnostics(platform: &dyn Platform, graph: &dyn FilterGraph) -> Option<RegistrationToken> {
    let registry = platform.diagnostics()?;
    let name = format!(
        "BDA Graph {} Pid {:08x}",
        graph.display_name(),
        std::process::id()
    );
    match registry.register(&name) {
        Ok(token) => {
            debug!("[Graph] Registered as '{}'", name);
            Some(token)
        }
        Err(e) => {
            warn!("[Graph] Diagnostic registration failed: {}", e);
            None
        }
    }
}

fn revoke_diagnostics(platform: &dyn Platform, token: Option<RegistrationToken>) {
    let (Some(token), Some(registry)) = (token, platform.diagnostics()) else {
        return;
    };
    if let Err(e) = registry.revoke(token) {
        warn!("[Graph] Cannot revoke diagnostic registration: {}", e);
    }
}
