//! Tune orchestration.
//!
//! [`BdaTuner`] owns one graph, one active tuning space and one sample
//! buffer. A submit translates the parameters once, then builds and starts
//! the graph, moving on to the next tuner device whenever a start fails.

use std::sync::Arc;

use log::{debug, error, info, warn};

use bdatune_types::{ConfigSource, NetworkStandard, TuneParameters, TuneRequest, TuningSpace};

use crate::buffer::{BufferStats, DrainReport, SampleBuffer};
use crate::error::{Result, TuneError};
use crate::graph::{BuildError, GraphBuilder};
use crate::locator::{self, SpaceResolution};
use crate::platform::{DeviceCategory, GraphState, Platform, RunOutcome, StateQuery};
use crate::settings::TunerSettings;

/// Broadcast tuner driving a platform filter graph.
pub struct BdaTuner {
    platform: Arc<dyn Platform>,
    settings: TunerSettings,
    buffer: Arc<SampleBuffer>,
    graph: GraphBuilder,
    tuning_space: Option<TuningSpace>,
    request: Option<TuneRequest>,
    resolution: Option<SpaceResolution>,
    running: bool,
}

impl BdaTuner {
    pub fn new(platform: Arc<dyn Platform>, settings: TunerSettings) -> Self {
        let buffer = Arc::new(SampleBuffer::with_limits(
            settings.sample_wait(),
            settings.max_queued_samples,
        ));
        let graph = GraphBuilder::new(
            Arc::clone(&platform),
            Arc::clone(&buffer),
            settings.register_diagnostics,
        );
        Self {
            platform,
            settings,
            buffer,
            graph,
            tuning_space: None,
            request: None,
            resolution: None,
            running: false,
        }
    }

    pub fn settings(&self) -> &TunerSettings {
        &self.settings
    }

    /// Active tuning space, if a submit got that far.
    pub fn tuning_space(&self) -> Option<&TuningSpace> {
        self.tuning_space.as_ref()
    }

    /// Tune request of the running graph.
    pub fn tune_request(&self) -> Option<&TuneRequest> {
        self.request.as_ref()
    }

    /// How the last submit obtained its tuning space.
    pub fn space_resolution(&self) -> Option<SpaceResolution> {
        self.resolution
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn graph(&self) -> &GraphBuilder {
        &self.graph
    }

    /// Buffer fed by the sample grabber.
    pub fn sample_buffer(&self) -> Arc<SampleBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub fn submit_atsc(&mut self, source: &dyn ConfigSource) -> Result<()> {
        self.submit_from(NetworkStandard::Atsc, source)
    }

    pub fn submit_dvbt(&mut self, source: &dyn ConfigSource) -> Result<()> {
        self.submit_from(NetworkStandard::DvbT, source)
    }

    pub fn submit_dvbc(&mut self, source: &dyn ConfigSource) -> Result<()> {
        self.submit_from(NetworkStandard::DvbC, source)
    }

    pub fn submit_dvbs(&mut self, source: &dyn ConfigSource) -> Result<()> {
        self.submit_from(NetworkStandard::DvbS, source)
    }

    /// Read the tune parameters of `standard` from `source` and submit them.
    pub fn submit_from(&mut self, standard: NetworkStandard, source: &dyn ConfigSource) -> Result<()> {
        let params = TuneParameters::from_source(source).map_err(|e| {
            warn!("[Tuner] {} parameters rejected: {}", standard, e);
            self.destroy();
            e
        })?;
        self.submit(standard, &params)
    }

    /// Tune to `params` and start the graph.
    ///
    /// Succeeds only once the graph is confirmed running. Each failed start
    /// rebuilds the graph with the next tuner device; at most one attempt is
    /// made per enumerated tuner.
    pub fn submit(&mut self, standard: NetworkStandard, params: &TuneParameters) -> Result<()> {
        info!("[Tuner] Submitting {} tune request", standard);
        // A failed submit leaves no graph behind.
        self.destroy();

        let prepared = locator::prepare(
            self.platform.tuning_spaces(),
            &mut self.tuning_space,
            standard,
            params,
        )
        .map_err(|e| {
            warn!("[Tuner] {} configuration failed: {}", standard, e);
            e
        })?;
        if prepared.resolution.replaced() {
            debug!("[Tuner] Tuning space replaced, tuner search starts over");
        } else {
            debug!("[Tuner] New run over the tuner devices");
        }
        self.graph.reset_cursor();
        self.resolution = Some(prepared.resolution);

        let Some(space) = self.tuning_space.as_ref() else {
            return Err(TuneError::Configuration(
                bdatune_types::ConfigurationError::TuningSpaceLookup {
                    standard,
                    reason: "no active tuning space".into(),
                },
            ));
        };

        let budget = self
            .platform
            .devices()
            .enumerate(DeviceCategory::NetworkTuner)
            .map_err(|e| {
                warn!("[Tuner] Cannot enumerate tuners: {}", e);
                TuneError::Platform(e)
            })?
            .len();
        debug!("[Tuner] {} tuner device(s) available", budget);

        let mut attempts = 0;
        while attempts < budget {
            attempts += 1;
            match self.graph.build(space, &prepared.request) {
                Ok(()) => {}
                Err(BuildError::NoTuner { .. }) => break,
                Err(e) if e.is_retryable() => {
                    warn!("[Tuner] Attempt {}: {}", attempts, e);
                    continue;
                }
                Err(e) => {
                    error!("[Tuner] Cannot build the graph: {}", e);
                    return Err(TuneError::Build(e));
                }
            }

            match start(&mut self.graph, &self.settings) {
                Ok(()) => {
                    info!("[Tuner] Graph running after {} attempt(s)", attempts);
                    self.request = Some(prepared.request);
                    self.running = true;
                    return Ok(());
                }
                Err(e) => {
                    warn!("[Tuner] Attempt {}: {}", attempts, e);
                    self.graph.teardown();
                }
            }
        }

        self.graph.teardown();
        error!("[Tuner] No tuner device could be started");
        Err(TuneError::DeviceExhausted { attempts })
    }

    /// Wait for data and return the size the next [`drain`](Self::drain) writes.
    pub fn snapshot_size(&self) -> Result<usize> {
        Ok(self.buffer.snapshot_size()?)
    }

    /// Copy the snapshot taken by [`snapshot_size`](Self::snapshot_size) into `dest`.
    pub fn drain(&self, dest: &mut [u8]) -> Result<DrainReport> {
        Ok(self.buffer.drain(dest)?)
    }

    /// Snapshot size in bytes, or -1 when no data arrived in time.
    pub fn buffer_size(&self) -> i64 {
        match self.snapshot_size() {
            Ok(size) => i64::try_from(size).unwrap_or(i64::MAX),
            Err(e) => {
                debug!("[Tuner] No data: {}", e);
                -1
            }
        }
    }

    /// Bytes written into `dest`, or -1 when the snapshot does not fit.
    pub fn read_buffer(&self, dest: &mut [u8]) -> i64 {
        match self.drain(dest) {
            Ok(report) => i64::try_from(report.bytes).unwrap_or(i64::MAX),
            Err(e) => {
                warn!("[Tuner] Read failed: {}", e);
                -1
            }
        }
    }

    /// Stop and release the graph.
    pub fn destroy(&mut self) {
        self.running = false;
        self.request = None;
        self.graph.teardown();
    }
}

impl Drop for BdaTuner {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Run the built graph and wait until it settles.
fn start(graph: &mut GraphBuilder, settings: &TunerSettings) -> Result<()> {
    let Some(control) = graph.media_control() else {
        return Err(TuneError::StartFailure { state: None });
    };

    match control.run() {
        Ok(RunOutcome::Running) => return Ok(()),
        Ok(RunOutcome::Pending) => debug!("[Tuner] Run pending, polling state"),
        Err(e) => warn!("[Tuner] Run failed: {}", e),
    }

    let mut state = None;
    for _ in 0..settings.max_state_polls {
        match control.state(settings.state_poll_timeout()) {
            Ok(StateQuery::Intermediate(current)) => state = Some(current),
            Ok(StateQuery::Settled(current)) => {
                state = Some(current);
                break;
            }
            Err(e) => {
                warn!("[Tuner] Cannot get graph state: {}", e);
                break;
            }
        }
    }

    if state == Some(GraphState::Running) {
        return Ok(());
    }
    if let Err(e) = control.stop() {
        warn!("[Tuner] Stop failed: {}", e);
    }
    Err(TuneError::StartFailure { state })
}
