//! In-process loopback platform.
//!
//! Implements every platform capability against one shared registry of
//! filters, pins and tuning spaces. A running graph spawns a producer thread
//! that pushes MPEG-TS null packets through the sample grabber callback, so
//! the whole pipeline works without tuner hardware.
//!
//! Device behaviour is scripted through [`LoopbackConfig`]: devices can be
//! busy (the graph never reaches the running state), fail to bind, or expose
//! pins of a foreign [`Medium`] so that connections are refused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use bdatune_types::{NetworkStandard, TuneRequest, TuningSpace};

use super::{
    DeviceCategory, DeviceDirectory, DeviceHandle, DiagnosticRegistry, Filter, FilterGraph,
    FilterId, FilterKind, GraphState, MediaControl, MediaType, Pin, PinDirection, PinId, Platform,
    PlatformError, PlatformResult, RegistrationToken, RunOutcome, SampleGrabber, SampleSink,
    StateQuery, TuneControl, TuningSpaceDirectory,
};
use crate::buffer::{Sample, TS_PACKET_SIZE};

/// PID of MPEG-TS null packets.
pub const NULL_PID: u16 = 0x1FFF;

/// Media carried by a loopback pin. Two pins connect when their media agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Medium {
    /// Accepts any peer.
    Any,
    #[default]
    TransportStream,
    /// Vendor-specific medium; only matches the same tag.
    Tag(u32),
}

impl Medium {
    pub fn accepts(self, other: Medium) -> bool {
        match (self, other) {
            (Medium::Any, _) | (_, Medium::Any) => true,
            (a, b) => a == b,
        }
    }
}

/// Pin layout entry of a loopback filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinSpec {
    pub direction: PinDirection,
    pub medium: Medium,
}

impl PinSpec {
    pub fn input(medium: Medium) -> Self {
        Self {
            direction: PinDirection::Input,
            medium,
        }
    }

    pub fn output(medium: Medium) -> Self {
        Self {
            direction: PinDirection::Output,
            medium,
        }
    }
}

/// A simulated hardware device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSpec {
    pub name: String,
    /// A graph containing this device never reaches the running state.
    pub busy: bool,
    /// Binding the device fails.
    pub bind_fails: bool,
    pub input: Medium,
    pub output: Medium,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self::new("Loopback Device")
    }
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            busy: false,
            bind_fails: false,
            input: Medium::TransportStream,
            output: Medium::TransportStream,
        }
    }

    pub fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    pub fn bind_fails(mut self) -> Self {
        self.bind_fails = true;
        self
    }

    pub fn with_input(mut self, medium: Medium) -> Self {
        self.input = medium;
        self
    }
}

/// Scripted device set and runtime behaviour of the loopback platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    pub tuners: Vec<DeviceSpec>,
    pub receivers: Vec<DeviceSpec>,
    pub transport_information: Vec<DeviceSpec>,
    /// Offer a diagnostic registry.
    pub diagnostics: bool,
    /// Diagnostic registration fails.
    pub diagnostics_fail: bool,
    /// Network providers refuse every tune request.
    pub reject_tune_requests: bool,
    /// `run` reports a pending transition that settles on the second state poll.
    pub asynchronous_start: bool,
    /// Null packets per delivered sample.
    pub packets_per_sample: usize,
    /// Pause between two samples, in milliseconds.
    pub sample_interval_ms: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            tuners: vec![DeviceSpec::new("Loopback Tuner")],
            receivers: vec![DeviceSpec::new("Loopback Receiver")],
            transport_information: vec![DeviceSpec::new("Loopback Transport Information")],
            diagnostics: true,
            diagnostics_fail: false,
            reject_tune_requests: false,
            asynchronous_start: false,
            packets_per_sample: 7,
            sample_interval_ms: 2,
        }
    }
}

/// Build one MPEG-TS null packet with the given continuity counter.
pub fn null_packet(continuity: u8) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0xFF; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = ((NULL_PID >> 8) as u8) & 0x1F;
    packet[2] = (NULL_PID & 0xFF) as u8;
    // Payload only.
    packet[3] = 0x10 | (continuity & 0x0F);
    packet
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Provider(NetworkStandard),
    Device(DeviceCategory),
    Grabber,
    Demultiplexer,
    Custom,
}

struct PinRecord {
    direction: PinDirection,
    medium: Medium,
    peer: Option<PinId>,
}

struct FilterRecord {
    name: String,
    role: Role,
    pins: Vec<PinId>,
    graph: Option<u64>,
    busy: bool,
    sink: Option<Arc<dyn SampleSink>>,
    media_type: Option<MediaType>,
    buffer_samples: bool,
    one_shot: bool,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    pins: HashMap<PinId, PinRecord>,
    filters: HashMap<FilterId, FilterRecord>,
    tuning_spaces: Vec<TuningSpace>,
    persisted: usize,
    registrations: HashMap<u32, String>,
    next_token: u32,
    last_tune_request: Option<TuneRequest>,
    released_filters: u64,
    bind_history: Vec<(DeviceCategory, usize)>,
}

impl Registry {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_filter(
        &mut self,
        name: &str,
        role: Role,
        layout: &[PinSpec],
        busy: bool,
    ) -> FilterId {
        let id = FilterId(self.allocate());
        let mut pins = Vec::with_capacity(layout.len());
        for spec in layout {
            let pin = PinId(self.allocate());
            self.pins.insert(
                pin,
                PinRecord {
                    direction: spec.direction,
                    medium: spec.medium,
                    peer: None,
                },
            );
            pins.push(pin);
        }
        self.filters.insert(
            id,
            FilterRecord {
                name: name.to_string(),
                role,
                pins,
                graph: None,
                busy,
                sink: None,
                media_type: None,
                buffer_samples: false,
                one_shot: false,
            },
        );
        id
    }

    /// Break every connection of `filter`.
    fn disconnect(&mut self, filter: FilterId) {
        let pins = match self.filters.get(&filter) {
            Some(record) => record.pins.clone(),
            None => return,
        };
        for pin in pins {
            let peer = self.pins.get_mut(&pin).and_then(|p| p.peer.take());
            if let Some(peer) = peer.and_then(|peer| self.pins.get_mut(&peer)) {
                peer.peer = None;
            }
        }
    }

    fn release(&mut self, filter: FilterId) {
        self.disconnect(filter);
        if let Some(record) = self.filters.remove(&filter) {
            for pin in &record.pins {
                self.pins.remove(pin);
            }
            self.released_filters += 1;
            debug!("[Loopback] Released filter {:?} ({})", filter, record.name);
        }
    }

    fn members(&self, graph: u64) -> impl Iterator<Item = &FilterRecord> {
        self.filters
            .values()
            .filter(move |record| record.graph == Some(graph))
    }
}

struct Inner {
    config: LoopbackConfig,
    registry: Arc<Mutex<Registry>>,
}

impl Inner {
    fn specs(&self, category: DeviceCategory) -> &[DeviceSpec] {
        match category {
            DeviceCategory::NetworkTuner => &self.config.tuners,
            DeviceCategory::ReceiverComponent => &self.config.receivers,
            DeviceCategory::TransportInformation => &self.config.transport_information,
        }
    }

    fn spec(&self, handle: &DeviceHandle) -> PlatformResult<&DeviceSpec> {
        self.specs(handle.category)
            .get(handle.index)
            .ok_or_else(|| PlatformError::NotFound(handle.path.clone()))
    }

    fn filter(&self, name: &str, role: Role, layout: &[PinSpec], busy: bool) -> Box<dyn Filter> {
        let id = self.registry.lock().insert_filter(name, role, layout, busy);
        Box::new(LoopbackFilter {
            id,
            role,
            reject_tune_requests: self.config.reject_tune_requests,
            registry: Arc::clone(&self.registry),
        })
    }
}

impl DeviceDirectory for Inner {
    fn enumerate(&self, category: DeviceCategory) -> PlatformResult<Vec<DeviceHandle>> {
        let scheme = match category {
            DeviceCategory::NetworkTuner => "tuner",
            DeviceCategory::ReceiverComponent => "receiver",
            DeviceCategory::TransportInformation => "tif",
        };
        Ok((0..self.specs(category).len())
            .map(|index| DeviceHandle {
                category,
                index,
                path: format!("loopback://{}/{}", scheme, index),
            })
            .collect())
    }

    fn bind(&self, handle: &DeviceHandle) -> PlatformResult<Box<dyn Filter>> {
        let spec = self.spec(handle)?;
        self.registry
            .lock()
            .bind_history
            .push((handle.category, handle.index));
        if spec.bind_fails {
            return Err(PlatformError::Failed(format!(
                "cannot bind {} ({})",
                spec.name, handle.path
            )));
        }
        let layout = match handle.category {
            DeviceCategory::TransportInformation => vec![PinSpec::input(spec.input)],
            _ => vec![PinSpec::input(spec.input), PinSpec::output(spec.output)],
        };
        Ok(self.filter(&spec.name, Role::Device(handle.category), &layout, spec.busy))
    }

    fn friendly_name(&self, handle: &DeviceHandle) -> PlatformResult<String> {
        Ok(self.spec(handle)?.name.clone())
    }
}

impl TuningSpaceDirectory for Inner {
    fn find(
        &self,
        standard: NetworkStandard,
        name: Option<&str>,
    ) -> PlatformResult<Option<TuningSpace>> {
        Ok(self
            .registry
            .lock()
            .tuning_spaces
            .iter()
            .find(|space| space.matches(standard, name))
            .cloned())
    }

    fn create(&self, standard: NetworkStandard, name: &str) -> PlatformResult<TuningSpace> {
        let mut registry = self.registry.lock();
        if registry.tuning_spaces.iter().any(|s| s.unique_name == name) {
            return Err(PlatformError::Failed(format!(
                "tuning space '{}' already exists",
                name
            )));
        }
        let space = TuningSpace::new(standard, name);
        registry.tuning_spaces.push(space.clone());
        info!("[Loopback] Created {} tuning space '{}'", standard, name);
        Ok(space)
    }

    fn persist(&self, space: &TuningSpace) -> PlatformResult<()> {
        let mut registry = self.registry.lock();
        match registry
            .tuning_spaces
            .iter_mut()
            .find(|s| s.unique_name == space.unique_name)
        {
            Some(stored) => *stored = space.clone(),
            None => registry.tuning_spaces.push(space.clone()),
        }
        registry.persisted += 1;
        Ok(())
    }
}

impl DiagnosticRegistry for Inner {
    fn register(&self, display_name: &str) -> PlatformResult<RegistrationToken> {
        if self.config.diagnostics_fail {
            return Err(PlatformError::Failed("diagnostic registry unavailable".into()));
        }
        let mut registry = self.registry.lock();
        registry.next_token += 1;
        let token = registry.next_token;
        registry
            .registrations
            .insert(token, display_name.to_string());
        Ok(RegistrationToken(token))
    }

    fn revoke(&self, token: RegistrationToken) -> PlatformResult<()> {
        self.registry
            .lock()
            .registrations
            .remove(&token.0)
            .map(|_| ())
            .ok_or_else(|| PlatformError::NotFound(format!("registration {}", token.0)))
    }
}

/// The loopback platform.
pub struct LoopbackPlatform {
    inner: Inner,
}

impl LoopbackPlatform {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            inner: Inner {
                config,
                registry: Arc::new(Mutex::new(Registry::default())),
            },
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.inner.config
    }

    /// Create a filter with an arbitrary pin layout.
    pub fn custom_filter(&self, layout: Vec<PinSpec>) -> Box<dyn Filter> {
        self.inner.filter("Custom", Role::Custom, &layout, false)
    }

    /// Store a tuning space as if another application had registered it.
    pub fn add_tuning_space(&self, space: TuningSpace) {
        self.inner.registry.lock().tuning_spaces.push(space);
    }

    pub fn stored_tuning_spaces(&self) -> Vec<TuningSpace> {
        self.inner.registry.lock().tuning_spaces.clone()
    }

    /// How many times a tuning space was written back.
    pub fn persist_count(&self) -> usize {
        self.inner.registry.lock().persisted
    }

    /// The last tune request accepted by a network provider.
    pub fn last_tune_request(&self) -> Option<TuneRequest> {
        self.inner.registry.lock().last_tune_request.clone()
    }

    /// Filters created and not yet released.
    pub fn live_filter_count(&self) -> usize {
        self.inner.registry.lock().filters.len()
    }

    pub fn released_filter_count(&self) -> u64 {
        self.inner.registry.lock().released_filters
    }

    /// Indices of every bind attempt on `category`, in call order.
    pub fn bind_history(&self, category: DeviceCategory) -> Vec<usize> {
        self.inner
            .registry
            .lock()
            .bind_history
            .iter()
            .filter(|(c, _)| *c == category)
            .map(|(_, index)| *index)
            .collect()
    }

    /// Filters currently added to any graph.
    pub fn graph_member_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .filters
            .values()
            .filter(|record| record.graph.is_some())
            .count()
    }

    /// Names of the graphs currently registered for diagnostics.
    pub fn registrations(&self) -> Vec<String> {
        let registry = self.inner.registry.lock();
        let mut names: Vec<String> = registry.registrations.values().cloned().collect();
        names.sort();
        names
    }
}

impl Default for LoopbackPlatform {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl Platform for LoopbackPlatform {
    fn devices(&self) -> &dyn DeviceDirectory {
        &self.inner
    }

    fn tuning_spaces(&self) -> &dyn TuningSpaceDirectory {
        &self.inner
    }

    fn diagnostics(&self) -> Option<&dyn DiagnosticRegistry> {
        if self.inner.config.diagnostics {
            Some(&self.inner)
        } else {
            None
        }
    }

    fn create_graph(&self) -> PlatformResult<Box<dyn FilterGraph>> {
        let id = self.inner.registry.lock().allocate();
        Ok(Box::new(LoopbackGraph {
            id,
            config: self.inner.config.clone(),
            registry: Arc::clone(&self.inner.registry),
        }))
    }

    fn create_filter(&self, kind: FilterKind) -> PlatformResult<Box<dyn Filter>> {
        let ts = Medium::TransportStream;
        let filter = match kind {
            FilterKind::NetworkProvider(standard) => self.inner.filter(
                standard.provider_name(),
                Role::Provider(standard),
                &[PinSpec::output(ts)],
                false,
            ),
            FilterKind::SampleGrabber => self.inner.filter(
                "Sample Grabber",
                Role::Grabber,
                &[PinSpec::input(ts), PinSpec::output(ts)],
                false,
            ),
            FilterKind::Demultiplexer => self.inner.filter(
                "MPEG-2 Demultiplexer",
                Role::Demultiplexer,
                &[PinSpec::input(ts), PinSpec::output(ts)],
                false,
            ),
        };
        Ok(filter)
    }
}

struct LoopbackFilter {
    id: FilterId,
    role: Role,
    reject_tune_requests: bool,
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackFilter {
    fn update(&self, apply: impl FnOnce(&mut FilterRecord)) -> PlatformResult<()> {
        let mut registry = self.registry.lock();
        let record = registry
            .filters
            .get_mut(&self.id)
            .ok_or_else(|| PlatformError::NotFound(format!("filter {:?}", self.id)))?;
        apply(record);
        Ok(())
    }
}

impl Filter for LoopbackFilter {
    fn id(&self) -> FilterId {
        self.id
    }

    fn pins(&self) -> PlatformResult<Vec<Box<dyn Pin>>> {
        let registry = self.registry.lock();
        let record = registry
            .filters
            .get(&self.id)
            .ok_or_else(|| PlatformError::NotFound(format!("filter {:?}", self.id)))?;
        Ok(record
            .pins
            .iter()
            .map(|&id| {
                Box::new(LoopbackPin {
                    id,
                    registry: Arc::clone(&self.registry),
                }) as Box<dyn Pin>
            })
            .collect())
    }

    fn tune_control(&mut self) -> Option<&mut dyn TuneControl> {
        match self.role {
            Role::Provider(_) => Some(self as &mut dyn TuneControl),
            _ => None,
        }
    }

    fn sample_grabber(&mut self) -> Option<&mut dyn SampleGrabber> {
        match self.role {
            Role::Grabber => Some(self as &mut dyn SampleGrabber),
            _ => None,
        }
    }
}

impl Drop for LoopbackFilter {
    fn drop(&mut self) {
        self.registry.lock().release(self.id);
    }
}

impl TuneControl for LoopbackFilter {
    fn validate(&self, request: &TuneRequest) -> PlatformResult<()> {
        let Role::Provider(standard) = self.role else {
            return Err(PlatformError::Unsupported("not a network provider".into()));
        };
        if request.standard() != standard {
            return Err(PlatformError::Incompatible(format!(
                "{} request on {} provider",
                request.standard(),
                standard
            )));
        }
        if self.reject_tune_requests {
            return Err(PlatformError::Failed("tune request rejected".into()));
        }
        Ok(())
    }

    fn put_tune_request(&mut self, request: &TuneRequest) -> PlatformResult<()> {
        self.validate(request)?;
        self.registry.lock().last_tune_request = Some(request.clone());
        Ok(())
    }
}

impl SampleGrabber for LoopbackFilter {
    fn set_media_type(&mut self, media_type: MediaType) -> PlatformResult<()> {
        self.update(|record| record.media_type = Some(media_type))
    }

    fn set_buffer_samples(&mut self, enabled: bool) -> PlatformResult<()> {
        self.update(|record| record.buffer_samples = enabled)
    }

    fn set_one_shot(&mut self, one_shot: bool) -> PlatformResult<()> {
        self.update(|record| record.one_shot = one_shot)
    }

    fn set_callback(&mut self, sink: Arc<dyn SampleSink>) -> PlatformResult<()> {
        self.update(|record| record.sink = Some(sink))
    }
}

struct LoopbackPin {
    id: PinId,
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackPin {
    fn read<T>(&self, f: impl FnOnce(&PinRecord) -> T) -> PlatformResult<T> {
        self.registry
            .lock()
            .pins
            .get(&self.id)
            .map(f)
            .ok_or_else(|| PlatformError::NotFound(format!("pin {:?}", self.id)))
    }
}

impl Pin for LoopbackPin {
    fn id(&self) -> PinId {
        self.id
    }

    fn direction(&self) -> PlatformResult<PinDirection> {
        self.read(|pin| pin.direction)
    }

    fn is_connected(&self) -> PlatformResult<bool> {
        self.read(|pin| pin.peer.is_some())
    }
}

struct LoopbackGraph {
    id: u64,
    config: LoopbackConfig,
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackGraph {
    fn owner_of(&self, registry: &Registry, pin: PinId) -> Option<FilterId> {
        registry
            .filters
            .iter()
            .find(|(_, record)| record.graph == Some(self.id) && record.pins.contains(&pin))
            .map(|(id, _)| *id)
    }
}

impl FilterGraph for LoopbackGraph {
    fn display_name(&self) -> String {
        format!("{:08x}", self.id)
    }

    fn add_filter(&mut self, filter: &dyn Filter, name: &str) -> PlatformResult<()> {
        let mut registry = self.registry.lock();
        let record = registry
            .filters
            .get_mut(&filter.id())
            .ok_or_else(|| PlatformError::NotFound(format!("filter {:?}", filter.id())))?;
        match record.graph {
            Some(graph) if graph != self.id => Err(PlatformError::Failed(format!(
                "{} already belongs to another graph",
                record.name
            ))),
            _ => {
                record.graph = Some(self.id);
                record.name = name.to_string();
                debug!("[Loopback] Graph {:08x}: added {}", self.id, name);
                Ok(())
            }
        }
    }

    fn remove_filter(&mut self, filter: &dyn Filter) -> PlatformResult<()> {
        let mut registry = self.registry.lock();
        let id = filter.id();
        if registry.filters.get(&id).and_then(|r| r.graph) != Some(self.id) {
            return Err(PlatformError::NotFound(format!("filter {:?} not in graph", id)));
        }
        registry.disconnect(id);
        if let Some(record) = registry.filters.get_mut(&id) {
            record.graph = None;
            debug!("[Loopback] Graph {:08x}: removed {}", self.id, record.name);
        }
        Ok(())
    }

    fn connect_direct(&mut self, output: &dyn Pin, input: &dyn Pin) -> PlatformResult<()> {
        let mut registry = self.registry.lock();
        let (out_id, in_id) = (output.id(), input.id());
        if self.owner_of(&registry, out_id).is_none() || self.owner_of(&registry, in_id).is_none()
        {
            return Err(PlatformError::NotFound("pin owner is not in this graph".into()));
        }

        let (Some(out_pin), Some(in_pin)) = (registry.pins.get(&out_id), registry.pins.get(&in_id))
        else {
            return Err(PlatformError::NotFound("pin released".into()));
        };
        if out_pin.direction != PinDirection::Output || in_pin.direction != PinDirection::Input {
            return Err(PlatformError::Incompatible("pin directions do not match".into()));
        }
        if out_pin.peer.is_some() || in_pin.peer.is_some() {
            return Err(PlatformError::Incompatible("pin already connected".into()));
        }
        if !out_pin.medium.accepts(in_pin.medium) {
            return Err(PlatformError::Incompatible(format!(
                "{:?} cannot feed {:?}",
                out_pin.medium, in_pin.medium
            )));
        }

        if let Some(pin) = registry.pins.get_mut(&out_id) {
            pin.peer = Some(in_id);
        }
        if let Some(pin) = registry.pins.get_mut(&in_id) {
            pin.peer = Some(out_id);
        }
        Ok(())
    }

    fn media_control(&mut self) -> PlatformResult<Box<dyn MediaControl>> {
        Ok(Box::new(LoopbackControl {
            graph: self.id,
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            state: GraphState::Stopped,
            transition: None,
            producer: None,
        }))
    }
}

impl Drop for LoopbackGraph {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        let members: Vec<FilterId> = registry
            .filters
            .iter()
            .filter(|(_, record)| record.graph == Some(self.id))
            .map(|(id, _)| *id)
            .collect();
        for id in members {
            registry.disconnect(id);
            if let Some(record) = registry.filters.get_mut(&id) {
                record.graph = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// A busy device keeps the graph paused.
    Blocked,
    /// Settles on the given number of further polls.
    Settling(u32),
}

struct LoopbackControl {
    graph: u64,
    config: LoopbackConfig,
    registry: Arc<Mutex<Registry>>,
    state: GraphState,
    transition: Option<Transition>,
    producer: Option<Producer>,
}

impl LoopbackControl {
    fn start_producer(&mut self, sink: Option<Arc<dyn SampleSink>>) {
        if self.producer.is_some() {
            return;
        }
        match sink {
            Some(sink) => {
                self.producer = Some(Producer::spawn(
                    sink,
                    self.config.packets_per_sample.max(1),
                    Duration::from_millis(self.config.sample_interval_ms),
                ));
            }
            None => warn!("[Loopback] Graph {:08x} has no sample callback", self.graph),
        }
    }
}

impl MediaControl for LoopbackControl {
    fn run(&mut self) -> PlatformResult<RunOutcome> {
        let (busy, sink) = {
            let registry = self.registry.lock();
            let busy = registry.members(self.graph).find(|r| r.busy).map(|r| r.name.clone());
            let sink = registry
                .members(self.graph)
                .filter(|r| r.role == Role::Grabber)
                .find_map(|r| r.sink.clone());
            (busy, sink)
        };

        if let Some(device) = busy {
            debug!("[Loopback] {} is busy; graph stays paused", device);
            self.state = GraphState::Paused;
            self.transition = Some(Transition::Blocked);
            return Ok(RunOutcome::Pending);
        }

        self.start_producer(sink);
        if self.config.asynchronous_start {
            self.state = GraphState::Paused;
            self.transition = Some(Transition::Settling(1));
            Ok(RunOutcome::Pending)
        } else {
            self.state = GraphState::Running;
            Ok(RunOutcome::Running)
        }
    }

    fn state(&mut self, _timeout: Duration) -> PlatformResult<StateQuery> {
        match self.transition {
            None => Ok(StateQuery::Settled(self.state)),
            Some(Transition::Blocked) => {
                self.transition = None;
                Ok(StateQuery::Settled(self.state))
            }
            Some(Transition::Settling(0)) => {
                self.transition = None;
                self.state = GraphState::Running;
                Ok(StateQuery::Settled(self.state))
            }
            Some(Transition::Settling(remaining)) => {
                self.transition = Some(Transition::Settling(remaining - 1));
                Ok(StateQuery::Intermediate(self.state))
            }
        }
    }

    fn stop(&mut self) -> PlatformResult<()> {
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }
        self.transition = None;
        self.state = GraphState::Stopped;
        Ok(())
    }
}

impl Drop for LoopbackControl {
    fn drop(&mut self) {
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }
    }
}

/// Thread pushing null-packet samples into the grabber callback.
struct Producer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Producer {
    fn spawn(sink: Arc<dyn SampleSink>, packets: usize, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut continuity: u8 = 0;
            let mut first = true;
            while !flag.load(Ordering::Acquire) {
                let mut data = BytesMut::with_capacity(packets * TS_PACKET_SIZE);
                for _ in 0..packets {
                    data.extend_from_slice(&null_packet(continuity));
                    continuity = continuity.wrapping_add(1) & 0x0F;
                }
                // The stream starts without a predecessor.
                sink.on_sample(Sample::new(data.freeze(), first));
                first = false;
                thread::sleep(interval);
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("[Loopback] Producer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct Collector {
        samples: Mutex<Vec<Sample>>,
    }

    impl SampleSink for Collector {
        fn on_sample(&self, sample: Sample) {
            self.samples.lock().push(sample);
        }
    }

    fn wait_for_samples(collector: &Collector, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if collector.samples.lock().len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_null_packet_layout() {
        let packet = null_packet(0x13);
        assert_eq!(packet[0], 0x47);
        assert_eq!(((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16, NULL_PID);
        assert_eq!(packet[3], 0x13);
        assert!(packet[4..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_medium_compatibility() {
        assert!(Medium::Any.accepts(Medium::Tag(3)));
        assert!(Medium::TransportStream.accepts(Medium::Any));
        assert!(Medium::Tag(3).accepts(Medium::Tag(3)));
        assert!(!Medium::Tag(3).accepts(Medium::TransportStream));
    }

    #[test]
    fn test_filter_drop_releases_once() {
        let platform = LoopbackPlatform::default();
        let grabber = platform.create_filter(FilterKind::SampleGrabber).unwrap();
        let demux = platform.create_filter(FilterKind::Demultiplexer).unwrap();
        assert_eq!(platform.live_filter_count(), 2);

        drop(grabber);
        drop(demux);
        assert_eq!(platform.live_filter_count(), 0);
        assert_eq!(platform.released_filter_count(), 2);
    }

    #[test]
    fn test_remove_filter_breaks_connections() {
        let platform = LoopbackPlatform::default();
        let mut graph = platform.create_graph().unwrap();
        let up = platform.custom_filter(vec![PinSpec::output(Medium::TransportStream)]);
        let down = platform.custom_filter(vec![PinSpec::input(Medium::TransportStream)]);
        graph.add_filter(up.as_ref(), "up").unwrap();
        graph.add_filter(down.as_ref(), "down").unwrap();

        let out = up.pins().unwrap().remove(0);
        let inp = down.pins().unwrap().remove(0);
        graph.connect_direct(out.as_ref(), inp.as_ref()).unwrap();
        assert!(out.is_connected().unwrap());

        graph.remove_filter(down.as_ref()).unwrap();
        assert!(!out.is_connected().unwrap());
        assert_eq!(platform.graph_member_count(), 1);
        assert!(graph.remove_filter(down.as_ref()).is_err());
    }

    #[test]
    fn test_connect_requires_graph_membership() {
        let platform = LoopbackPlatform::default();
        let mut graph = platform.create_graph().unwrap();
        let up = platform.custom_filter(vec![PinSpec::output(Medium::Any)]);
        let down = platform.custom_filter(vec![PinSpec::input(Medium::Any)]);
        graph.add_filter(up.as_ref(), "up").unwrap();

        let out = up.pins().unwrap().remove(0);
        let inp = down.pins().unwrap().remove(0);
        assert!(matches!(
            graph.connect_direct(out.as_ref(), inp.as_ref()),
            Err(PlatformError::NotFound(_))
        ));
    }

    #[test]
    fn test_running_graph_feeds_grabber_callback() {
        let platform = LoopbackPlatform::default();
        let mut graph = platform.create_graph().unwrap();
        let mut grabber = platform.create_filter(FilterKind::SampleGrabber).unwrap();
        graph.add_filter(grabber.as_ref(), "Sample Grabber").unwrap();

        let collector = Arc::new(Collector::default());
        grabber
            .sample_grabber()
            .unwrap()
            .set_callback(collector.clone())
            .unwrap();

        let mut control = graph.media_control().unwrap();
        assert_eq!(control.run().unwrap(), RunOutcome::Running);
        assert!(wait_for_samples(&collector, 2));
        control.stop().unwrap();

        let samples = collector.samples.lock();
        assert!(samples[0].is_discontinuity());
        assert!(!samples[1].is_discontinuity());
        assert_eq!(samples[0].len(), 7 * TS_PACKET_SIZE);
        assert!(samples[0].data().chunks(TS_PACKET_SIZE).all(|p| p[0] == 0x47));
    }

    #[test]
    fn test_busy_device_never_runs() {
        let platform = LoopbackPlatform::new(LoopbackConfig {
            tuners: vec![DeviceSpec::new("Busy").busy()],
            ..LoopbackConfig::default()
        });
        let mut graph = platform.create_graph().unwrap();
        let handle = platform.devices().enumerate(DeviceCategory::NetworkTuner).unwrap()[0].clone();
        let tuner = platform.devices().bind(&handle).unwrap();
        graph.add_filter(tuner.as_ref(), "Busy").unwrap();

        let mut control = graph.media_control().unwrap();
        assert_eq!(control.run().unwrap(), RunOutcome::Pending);
        assert_eq!(
            control.state(Duration::from_millis(100)).unwrap(),
            StateQuery::Settled(GraphState::Paused)
        );
    }

    #[test]
    fn test_asynchronous_start_settles() {
        let platform = LoopbackPlatform::new(LoopbackConfig {
            asynchronous_start: true,
            ..LoopbackConfig::default()
        });
        let mut graph = platform.create_graph().unwrap();
        let mut control = graph.media_control().unwrap();
        assert_eq!(control.run().unwrap(), RunOutcome::Pending);
        assert_eq!(
            control.state(Duration::from_millis(100)).unwrap(),
            StateQuery::Intermediate(GraphState::Paused)
        );
        assert_eq!(
            control.state(Duration::from_millis(100)).unwrap(),
            StateQuery::Settled(GraphState::Running)
        );
    }

    #[test]
    fn test_tune_control_checks_standard() {
        let platform = LoopbackPlatform::default();
        let mut provider = platform
            .create_filter(FilterKind::NetworkProvider(NetworkStandard::DvbC))
            .unwrap();
        let space = TuningSpace::new(NetworkStandard::DvbT, "Terrestrial");
        let request = space
            .create_tune_request(bdatune_types::Locator::DvbT(Default::default()))
            .unwrap();

        let control = provider.tune_control().unwrap();
        assert!(matches!(
            control.put_tune_request(&request),
            Err(PlatformError::Incompatible(_))
        ));
        assert!(platform.last_tune_request().is_none());
    }

    #[test]
    fn test_diagnostic_registry_tokens() {
        let platform = LoopbackPlatform::default();
        let registry = platform.diagnostics().unwrap();
        let token = registry.register("BDA Graph 00000001 Pid 00000042").unwrap();
        assert_eq!(platform.registrations(), vec!["BDA Graph 00000001 Pid 00000042"]);
        registry.revoke(token).unwrap();
        assert!(registry.revoke(token).is_err());
        assert!(platform.registrations().is_empty());
    }

    #[test]
    fn test_tuning_space_directory() {
        let platform = LoopbackPlatform::default();
        let spaces = platform.tuning_spaces();
        assert_eq!(spaces.find(NetworkStandard::DvbS, None).unwrap(), None);

        let created = spaces.create(NetworkStandard::DvbS, "Astra").unwrap();
        assert_eq!(spaces.find(NetworkStandard::DvbS, None).unwrap(), Some(created.clone()));
        assert_eq!(spaces.find(NetworkStandard::DvbS, Some("Hotbird")).unwrap(), None);
        assert!(spaces.create(NetworkStandard::DvbT, "Astra").is_err());

        let mut updated = created;
        updated.satellite.lnb_switch = Some(11_700_000);
        spaces.persist(&updated).unwrap();
        assert_eq!(platform.stored_tuning_spaces(), vec![updated]);
        assert_eq!(platform.persist_count(), 1);
    }
}
