//! Machine dispatcher
//!
//! One thread owns the machine state, the device session and the active
//! build. Each pass of its loop checks the driver for fatal conditions,
//! executes every queued request that is valid for the current state,
//! advances the build by one step, and then waits: indefinitely while idle,
//! or for the build's poll interval while a build runs.

use crate::builder::{
    BuildStrategy, DeviceSink, DirectBuilder, FileSink, HaltPolicy, RemoteCaptureSink,
    RemotePlaybackBuilder,
};
use crate::pending::{BuildTarget, CommandQueue, ExtruderRequest, PendingCommand};
use crate::poller::StatusPoller;
use crate::simulator::MotionSimulator;
use crate::source::{ChainedSource, CommandSource};
use parking_lot::{Condvar, Mutex};
use printhost_communication::{
    ConnectionParams, Connector, DriverConfig, ExtrusionConfig, ExtrusionUpdater, FatalCondition,
    ProtocolDriver, RemoteStorage, SdCardStorage,
};
use printhost_core::{
    BuildMode, BuildProgress, Error, EventDispatcher, MachineEvent, MachineState,
    MachineStatusSnapshot, Result, ToolStatus,
};
use printhost_settings::MachineConfig;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Attempts made for a single run-command request
const RUN_COMMAND_ATTEMPTS: u32 = 3;

/// State shared between the dispatcher thread and the control facade
pub(crate) struct MachineShared {
    pub(crate) queue: Arc<CommandQueue>,
    pub(crate) events: EventDispatcher,
    snapshot: Mutex<MachineStatusSnapshot>,
    changed: Condvar,
    driver: Mutex<Option<Arc<ProtocolDriver>>>,
    done: Mutex<bool>,
    stopped: Condvar,
}

impl MachineShared {
    pub(crate) fn new(event_capacity: usize) -> Self {
        Self {
            queue: Arc::new(CommandQueue::new()),
            events: EventDispatcher::new(event_capacity),
            snapshot: Mutex::new(MachineStatusSnapshot::new()),
            changed: Condvar::new(),
            driver: Mutex::new(None),
            done: Mutex::new(false),
            stopped: Condvar::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> MachineStatusSnapshot {
        self.snapshot.lock().clone()
    }

    /// Wait until the snapshot satisfies `predicate`
    pub(crate) fn wait_for_state(
        &self,
        predicate: impl Fn(&MachineStatusSnapshot) -> bool,
        timeout: Duration,
    ) -> Option<MachineStatusSnapshot> {
        let deadline = Instant::now() + timeout;
        let mut snapshot = self.snapshot.lock();
        while !predicate(&snapshot) {
            if self.changed.wait_until(&mut snapshot, deadline).timed_out() {
                return predicate(&snapshot).then(|| snapshot.clone());
            }
        }
        Some(snapshot.clone())
    }

    /// Driver of the current session, if connected
    pub(crate) fn driver(&self) -> Option<Arc<ProtocolDriver>> {
        self.driver.lock().clone()
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done.lock()
    }

    /// Wait for the dispatcher loop to exit; `false` on timeout
    pub(crate) fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.stopped.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    fn update(&self, apply: impl FnOnce(&mut MachineStatusSnapshot)) {
        let mut snapshot = self.snapshot.lock();
        apply(&mut snapshot);
        snapshot.timestamp = chrono::Utc::now();
        self.changed.notify_all();
    }
}

/// Marks the dispatcher finished however its thread exits
struct DoneGuard(Arc<MachineShared>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.events.publish(MachineEvent::Shutdown);
        *self.0.done.lock() = true;
        self.0.stopped.notify_all();
        self.0.changed.notify_all();
    }
}

/// An attached device and the workers that serve it
struct Session {
    driver: Arc<ProtocolDriver>,
    storage: Arc<dyn RemoteStorage>,
    extruder: ExtrusionUpdater,
    poller: Option<StatusPoller>,
}

struct ActiveBuild {
    strategy: Box<dyn BuildStrategy>,
    started: Instant,
    /// Every line reaching the device lands in a stored file
    captures_remote: bool,
}

enum StepOutcome {
    Continue(Option<Duration>),
    Retry,
    Finished,
    Failed(Error),
}

/// Owner of the machine state; runs on the dispatcher thread
pub(crate) struct Dispatcher {
    config: MachineConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<MachineShared>,
    state: MachineState,
    session: Option<Session>,
    build: Option<ActiveBuild>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: MachineConfig,
        connector: Arc<dyn Connector>,
        shared: Arc<MachineShared>,
    ) -> Self {
        Self {
            config,
            connector,
            shared,
            state: MachineState::Disconnected,
            session: None,
            build: None,
        }
    }

    /// Run the loop until a shutdown request arrives
    pub(crate) fn run(mut self) {
        let _done = DoneGuard(Arc::clone(&self.shared));
        info!("Dispatcher for {} started", self.config.name);

        'dispatch: loop {
            self.check_driver();

            for command in self.shared.queue.drain() {
                if let PendingCommand::Shutdown = command {
                    break 'dispatch;
                }
                self.execute(command);
            }

            if self.state.is_building() {
                match self.step_build() {
                    Some(wait) => self.shared.queue.wait_timeout(wait),
                    None => continue,
                }
            } else {
                self.shared.queue.wait();
            }
        }

        info!("Dispatcher shutting down");
        self.abort_build();
        if self.session.is_some() {
            self.teardown_session();
            self.set_state(MachineState::Disconnected, Some("Shut down".to_string()));
        }
    }

    fn execute(&mut self, command: PendingCommand) {
        debug!("Executing {:?} in state {}", command, self.state);
        match command {
            PendingCommand::Connect { port } => self.connect(port),
            PendingCommand::Disconnect => self.disconnect(),
            PendingCommand::Reset => self.reset(),
            PendingCommand::Build { source, target } => self.start_build(source, target),
            PendingCommand::PlayRemote { name } => self.play_remote(name),
            PendingCommand::Pause => self.pause(),
            PendingCommand::Unpause => self.unpause(),
            PendingCommand::StopMotion => self.stop(false),
            PendingCommand::StopAll => self.stop(true),
            PendingCommand::RunCommand(instruction) => self.run_command(&instruction),
            PendingCommand::Extruder(request) => self.extruder(request),
            PendingCommand::Shutdown => {}
        }
    }

    fn ignore(&self, command: &str) {
        debug!("Ignoring {} in state {}", command, self.state);
    }

    fn set_state(&mut self, state: MachineState, message: Option<String>) {
        let previous = self.state;
        self.state = state;
        match &message {
            Some(message) => info!("{} -> {}: {}", previous, state, message),
            None => info!("{} -> {}", previous, state),
        }
        self.shared.update(|snapshot| {
            snapshot.state = state;
            snapshot.message = message.clone();
        });
        self.shared.events.publish(MachineEvent::StateChanged {
            previous,
            current: state,
            message,
        });
    }

    /// Report a failure without changing state
    fn report(&mut self, message: String) {
        warn!("{}", message);
        self.set_state(self.state, Some(message));
    }

    fn publish_progress(&self, progress: BuildProgress) {
        self.shared
            .update(|snapshot| snapshot.progress = Some(progress));
        self.shared.events.publish(MachineEvent::Progress(progress));
    }

    fn publish_tool(&self, tool: ToolStatus) {
        self.shared.update(|snapshot| snapshot.tool = tool);
        self.shared.events.publish(MachineEvent::ToolStatus(tool));
    }

    /// State to settle in when no build is running
    fn idle_state(&self) -> MachineState {
        if self.session.is_some() {
            MachineState::Ready
        } else {
            MachineState::Disconnected
        }
    }

    fn check_driver(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(condition) = session.driver.fatal_condition() else {
            return;
        };
        if self.state.is_error() {
            return;
        }
        self.handle_fatal(condition);
    }

    fn handle_fatal(&mut self, condition: FatalCondition) {
        error!("Fatal device condition: {}", condition);
        self.abort_build();
        match condition {
            FatalCondition::ConnectionLost(_) => {
                self.teardown_session();
                self.set_state(MachineState::Disconnected, Some(condition.to_string()));
            }
            FatalCondition::Fault(_) => {
                if let Some(session) = &self.session {
                    session.extruder.disable();
                }
                self.set_state(MachineState::Error, Some(condition.to_string()));
            }
        }
    }

    fn connect(&mut self, port: Option<String>) {
        if self.state != MachineState::Disconnected {
            return self.ignore("connect");
        }
        self.set_state(MachineState::Connecting, None);

        match self.open_session(port) {
            Ok(session) => {
                let name = session.driver.name().to_string();
                *self.shared.driver.lock() = Some(Arc::clone(&session.driver));
                let tool = session.driver.tool_status();
                self.session = Some(session);
                self.publish_tool(tool);
                self.set_state(MachineState::Ready, Some(format!("Connected to {}", name)));
            }
            Err(e) => {
                self.set_state(
                    MachineState::Disconnected,
                    Some(format!("Failed to connect: {}", e)),
                );
            }
        }
    }

    fn open_session(&self, port: Option<String>) -> Result<Session> {
        let mut params = ConnectionParams::from_config(&self.config);
        if let Some(port) = port {
            params = params.with_port(port);
        }
        info!("Connecting to {} at {} baud", params.port, params.baud_rate);

        let transport = self.connector.open(&params)?;
        let driver = Arc::new(ProtocolDriver::connect(
            transport,
            DriverConfig::from(&self.config),
        )?);

        let queue = Arc::clone(&self.shared.queue);
        driver.set_fatal_hook(Box::new(move |condition| {
            debug!("Waking dispatcher for {}", condition);
            queue.wake();
        }));

        let extruder = ExtrusionUpdater::new(driver.clone(), ExtrusionConfig::from(&self.config));
        if let Err(e) = extruder.start() {
            driver.close();
            return Err(e);
        }

        let poller = if self.config.polling.enabled {
            match StatusPoller::start(
                Arc::clone(&self.shared.queue),
                self.config.protocol.temperature_query.clone(),
                self.config.poll_interval(),
            ) {
                Ok(poller) => Some(poller),
                Err(e) => {
                    warn!("Status polling disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let storage: Arc<dyn RemoteStorage> = Arc::new(SdCardStorage::new(
            driver.clone(),
            self.config.remote_response_timeout(),
        ));

        Ok(Session {
            driver,
            storage,
            extruder,
            poller,
        })
    }

    fn teardown_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        *self.shared.driver.lock() = None;
        if let Some(mut poller) = session.poller.take() {
            poller.stop();
        }
        // Closing first wakes an extruder blocked on device capacity
        session.driver.close();
        session.extruder.stop();
    }

    fn disconnect(&mut self) {
        if self.session.is_none() {
            return self.ignore("disconnect");
        }
        self.abort_build();
        self.teardown_session();
        self.set_state(MachineState::Disconnected, Some("Disconnected".to_string()));
    }

    fn reset(&mut self) {
        if !matches!(self.state, MachineState::Ready | MachineState::Error) {
            return self.ignore("reset");
        }
        let Some(session) = &self.session else {
            return self.ignore("reset");
        };

        session.extruder.disable();
        match session.driver.initialize() {
            Ok(()) => {
                let tool = session.driver.tool_status();
                self.publish_tool(tool);
                self.set_state(MachineState::Ready, Some("Device reset".to_string()));
            }
            Err(e) => {
                self.teardown_session();
                self.set_state(
                    MachineState::Disconnected,
                    Some(format!("Reset failed: {}", e)),
                );
            }
        }
    }

    fn bracketed(&self, source: Box<dyn CommandSource>) -> Box<dyn CommandSource> {
        Box::new(ChainedSource::bracketed(
            &self.config.build.warmup,
            source,
            &self.config.build.cooldown,
        ))
    }

    fn halt_policy(&self) -> Box<HaltPolicy> {
        Box::new(HaltPolicy(self.config.build.optional_halt))
    }

    fn start_build(&mut self, source: Box<dyn CommandSource>, target: BuildTarget) {
        let mode = match (&target, self.state) {
            (BuildTarget::LocalFile(_), MachineState::Disconnected) => BuildMode::Offline,
            (_, state) if state.can_start_build() && self.session.is_some() => BuildMode::Online,
            _ => return self.ignore("build"),
        };

        let source = self.bracketed(source);
        let drain_poll = self.config.finish_poll();
        let attached = self
            .session
            .as_ref()
            .map(|session| (Arc::clone(&session.driver), Arc::clone(&session.storage)));
        let strategy: Box<dyn BuildStrategy> = match (&target, attached) {
            (BuildTarget::LocalFile(path), _) => match FileSink::create(path) {
                Ok(sink) => Box::new(
                    DirectBuilder::new(source, sink, self.halt_policy())
                        .with_drain_poll(drain_poll),
                ),
                Err(e) => return self.report(format!("Build not started: {}", e)),
            },
            (BuildTarget::Device, Some((driver, _))) => {
                let builder = DirectBuilder::new(source, DeviceSink::new(driver), self.halt_policy())
                .with_drain_poll(drain_poll);
                if self.config.build.simulate {
                    Box::new(builder.with_simulator(Box::new(MotionSimulator::new())))
                } else {
                    Box::new(builder)
                }
            }
            (BuildTarget::RemoteFile(name), Some((driver, storage))) => Box::new(
                DirectBuilder::new(
                    source,
                    RemoteCaptureSink::new(driver, storage, name.clone()),
                    self.halt_policy(),
                )
                .with_drain_poll(drain_poll),
            ),
            _ => return self.ignore("build"),
        };

        let label = match &target {
            BuildTarget::Device => "Building".to_string(),
            BuildTarget::LocalFile(path) => format!("Building to {}", path.display()),
            BuildTarget::RemoteFile(name) => format!("Building to remote file {}", name),
        };
        let captures_remote = matches!(target, BuildTarget::RemoteFile(_));
        if captures_remote {
            if let Some(poller) = self.session.as_ref().and_then(|s| s.poller.as_ref()) {
                poller.suspend();
            }
        }
        self.begin(strategy, mode, label, captures_remote);
    }

    fn play_remote(&mut self, name: String) {
        let Some(session) = &self.session else {
            return self.ignore("play-remote");
        };
        if !self.state.can_start_build() {
            return self.ignore("play-remote");
        }

        match RemotePlaybackBuilder::start(
            Arc::clone(&session.storage),
            name.clone(),
            self.config.remote_poll_interval(),
        ) {
            Ok(builder) => {
                self.begin(
                    Box::new(builder),
                    BuildMode::Online,
                    format!("Playing remote file {}", name),
                    false,
                );
            }
            Err(e) => self.report(format!("Playback of {} not started: {}", name, e)),
        }
    }

    fn begin(
        &mut self,
        strategy: Box<dyn BuildStrategy>,
        mode: BuildMode,
        label: String,
        captures_remote: bool,
    ) {
        self.shared.update(|snapshot| snapshot.progress = None);
        self.build = Some(ActiveBuild {
            strategy,
            started: Instant::now(),
            captures_remote,
        });
        self.set_state(MachineState::building(mode), Some(label));
    }

    fn step_build(&mut self) -> Option<Duration> {
        let finish_poll = self.config.finish_poll();
        let outcome = {
            let build = self.build.as_mut()?;
            match build.strategy.advance_one_step() {
                Err(e) if e.is_retryable() => {
                    debug!("Retrying build step: {}", e);
                    StepOutcome::Retry
                }
                Err(e) => StepOutcome::Failed(e),
                Ok(()) => {
                    let progress = build.strategy.progress(build.started.elapsed());
                    self.shared
                        .update(|snapshot| snapshot.progress = Some(progress));
                    self.shared.events.publish(MachineEvent::Progress(progress));

                    match build.strategy.is_finished() {
                        Ok(true) => StepOutcome::Finished,
                        Ok(false) => StepOutcome::Continue(build.strategy.poll_interval()),
                        Err(e) if e.is_retryable() => StepOutcome::Retry,
                        Err(e) => StepOutcome::Failed(e),
                    }
                }
            }
        };

        match outcome {
            StepOutcome::Continue(wait) => wait,
            StepOutcome::Retry => Some(finish_poll),
            StepOutcome::Finished => {
                self.finish_build();
                None
            }
            StepOutcome::Failed(e) => {
                self.fail_build(e);
                None
            }
        }
    }

    /// End the active build, resuming polling after a remote capture
    fn take_build(&mut self) -> Option<ActiveBuild> {
        let build = self.build.take()?;
        if build.captures_remote {
            if let Some(poller) = self.session.as_ref().and_then(|s| s.poller.as_ref()) {
                poller.resume();
            }
        }
        Some(build)
    }

    fn finish_build(&mut self) {
        let Some(build) = self.take_build() else {
            return;
        };
        let progress = build.strategy.progress(build.started.elapsed());
        info!("Build finished: {}", progress);
        self.publish_progress(progress);
        self.set_state(self.idle_state(), Some("Build finished".to_string()));
    }

    fn fail_build(&mut self, e: Error) {
        error!("Build failed: {}", e);
        self.abort_build();

        let fatal = self
            .session
            .as_ref()
            .and_then(|session| session.driver.fatal_condition());
        match fatal {
            Some(condition) => self.handle_fatal(condition),
            None => self.set_state(self.idle_state(), Some(format!("Build failed: {}", e))),
        }
    }

    fn abort_build(&mut self) {
        if let Some(mut build) = self.take_build() {
            debug!(
                "Aborting build after {} lines",
                build.strategy.lines_processed()
            );
            build.strategy.abort();
        }
    }

    fn pause(&mut self) {
        let Some(mode) = self.state.build_mode().filter(|_| self.state.is_building()) else {
            return self.ignore("pause");
        };
        self.set_state(MachineState::Paused { resume: mode }, None);
    }

    fn unpause(&mut self) {
        let MachineState::Paused { resume } = self.state else {
            return self.ignore("unpause");
        };
        self.set_state(MachineState::building(resume), None);
    }

    fn stop(&mut self, all: bool) {
        // The facade may have interrupted the driver before enqueuing
        if let Some(session) = &self.session {
            session.driver.resume_sending();
            session.extruder.disable();
        }
        if !self.state.has_build() {
            return self.ignore(if all { "stop-all" } else { "stop-motion" });
        }

        self.set_state(MachineState::Stopping, None);
        self.abort_build();

        if all {
            if let Some(session) = &self.session {
                for instruction in &self.config.protocol.heaters_off {
                    if let Err(e) = session.driver.send_control(instruction) {
                        warn!("Failed to send {}: {}", instruction, e);
                    }
                }
                let tool = session.driver.tool_status();
                self.publish_tool(tool);
            }
        }

        let message = if all {
            "Build stopped, heaters off"
        } else {
            "Build stopped"
        };
        self.set_state(self.idle_state(), Some(message.to_string()));
    }

    fn run_command(&mut self, instruction: &str) {
        // Anything sent during a remote capture would be stored in the file
        let capturing = self.build.as_ref().is_some_and(|b| b.captures_remote);
        let valid = matches!(self.state, MachineState::Ready)
            || (self.state.has_build() && !capturing);
        let Some(session) = self.session.as_ref().filter(|_| valid) else {
            return self.ignore("run-command");
        };

        for attempt in 1..=RUN_COMMAND_ATTEMPTS {
            match session.driver.send(instruction) {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < RUN_COMMAND_ATTEMPTS => {
                    debug!("Retrying {} ({}): {}", instruction, attempt, e);
                    thread::sleep(self.config.finish_poll());
                }
                Err(e) => {
                    warn!("Command {} failed: {}", instruction, e);
                    return;
                }
            }
        }

        let tool = session.driver.tool_status();
        self.publish_tool(tool);
    }

    fn extruder(&mut self, request: ExtruderRequest) {
        let Some(session) = self.session.as_ref().filter(|_| self.state == MachineState::Ready)
        else {
            return self.ignore("extruder");
        };
        match request {
            ExtruderRequest::Start {
                feedrate,
                direction,
            } => session.extruder.enable(feedrate, direction),
            ExtruderRequest::Stop => session.extruder.disable(),
        }
    }
}
