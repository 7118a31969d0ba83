//! Line-by-line builds
//!
//! [`DirectBuilder`] pulls one source line per step, interprets it and hands
//! the resulting instructions to its sink. A line counts as processed only
//! once every instruction it produced was accepted; a retryable failure
//! keeps the remaining instructions for the next step.

use super::{BuildStrategy, HaltPrompt, InstructionSink};
use crate::interpreter::{DeviceInstruction, GcodeInterpreter};
use crate::simulator::Simulator;
use crate::source::CommandSource;
use printhost_communication::ProtocolDriver;
use printhost_core::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Streams instructions to the connected device
pub struct DeviceSink {
    driver: Arc<ProtocolDriver>,
}

impl DeviceSink {
    /// Create a sink over a connected driver
    pub fn new(driver: Arc<ProtocolDriver>) -> Self {
        Self { driver }
    }
}

impl InstructionSink for DeviceSink {
    fn accept(&mut self, instruction: &str) -> Result<()> {
        self.driver.send(instruction)
    }

    fn is_drained(&self) -> bool {
        self.driver.is_finished()
    }

    fn complete(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Direct-to-device build
pub type Direct = DirectBuilder<DeviceSink>;

/// Pulls, interprets and delivers one source line per step
pub struct DirectBuilder<S> {
    source: Box<dyn CommandSource>,
    interpreter: GcodeInterpreter,
    sink: S,
    halt: Box<dyn HaltPrompt>,
    simulator: Option<Box<dyn Simulator>>,
    pending: VecDeque<DeviceInstruction>,
    lines_processed: u64,
    exhausted: bool,
    completed: bool,
    drain_poll: Duration,
}

impl<S: InstructionSink> DirectBuilder<S> {
    /// Create a builder feeding `source` into `sink`
    pub fn new(source: Box<dyn CommandSource>, sink: S, halt: Box<dyn HaltPrompt>) -> Self {
        Self {
            source,
            interpreter: GcodeInterpreter::new(),
            sink,
            halt,
            simulator: None,
            pending: VecDeque::new(),
            lines_processed: 0,
            exhausted: false,
            completed: false,
            drain_poll: Duration::from_millis(10),
        }
    }

    /// Builder method to mirror sent instructions into a simulator
    pub fn with_simulator(mut self, simulator: Box<dyn Simulator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    /// Builder method to set the wait between drain checks
    pub fn with_drain_poll(mut self, interval: Duration) -> Self {
        self.drain_poll = interval;
        self
    }

    /// The destination
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The simulator, if one is attached
    pub fn simulator(&self) -> Option<&dyn Simulator> {
        self.simulator.as_deref()
    }

    fn end_program(&mut self, reason: &DeviceInstruction) {
        info!("Build ended by {}", reason);
        self.pending.clear();
        self.exhausted = true;
    }

    fn rewind(&mut self) -> Result<()> {
        info!("Program rewind, restarting from the first line");
        self.source.rewind()?;
        self.pending.clear();
        self.lines_processed = 0;
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.reset();
        }
        Ok(())
    }
}

impl<S: InstructionSink> BuildStrategy for DirectBuilder<S> {
    fn advance_one_step(&mut self) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }

        if self.pending.is_empty() {
            match self.source.next_line()? {
                Some(line) => self.pending.extend(self.interpreter.interpret(&line)),
                None => {
                    debug!("Source exhausted after {} lines", self.lines_processed);
                    self.exhausted = true;
                    return Ok(());
                }
            }
        }

        while let Some(instruction) = self.pending.front().cloned() {
            match instruction {
                DeviceInstruction::Send(text) => {
                    self.sink.accept(&text)?;
                    if let Some(simulator) = self.simulator.as_mut() {
                        if let Err(e) = simulator.simulate(&text) {
                            debug!("Simulator rejected {}: {}", text, e);
                        }
                    }
                    self.pending.pop_front();
                }
                DeviceInstruction::OptionalHalt => {
                    if self.halt.continue_build() {
                        debug!("Continuing past optional halt");
                        self.pending.pop_front();
                    } else {
                        self.end_program(&instruction);
                        return Ok(());
                    }
                }
                DeviceInstruction::UnconditionalHalt | DeviceInstruction::ProgramEnd => {
                    self.end_program(&instruction);
                    return Ok(());
                }
                DeviceInstruction::ProgramRewind => return self.rewind(),
            }
        }

        self.lines_processed += 1;
        Ok(())
    }

    fn is_finished(&mut self) -> Result<bool> {
        if !self.exhausted {
            return Ok(false);
        }
        if !self.completed {
            self.sink.complete()?;
            self.completed = true;
        }
        Ok(self.sink.is_drained())
    }

    fn lines_processed(&self) -> u64 {
        self.lines_processed
    }

    fn lines_total(&self) -> Option<u64> {
        self.source.line_count()
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.exhausted.then_some(self.drain_poll)
    }

    fn abort(&mut self) {
        self.pending.clear();
        self.exhausted = true;
        self.completed = true;
        self.sink.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::HaltPolicy;
    use crate::simulator::MotionSimulator;
    use crate::source::StringListSource;
    use printhost_core::{DriverError, Error};
    use printhost_settings::OptionalHaltPolicy;

    #[derive(Default)]
    struct ScriptedSink {
        accepted: Vec<String>,
        fail_on: Option<String>,
        completed: bool,
        aborted: bool,
    }

    impl InstructionSink for ScriptedSink {
        fn accept(&mut self, instruction: &str) -> Result<()> {
            if self.fail_on.as_deref() == Some(instruction) {
                self.fail_on = None;
                return Err(DriverError::Retryable {
                    reason: "device busy".to_string(),
                }
                .into());
            }
            self.accepted.push(instruction.to_string());
            Ok(())
        }

        fn is_drained(&self) -> bool {
            true
        }

        fn complete(&mut self) -> Result<()> {
            self.completed = true;
            Ok(())
        }

        fn abort(&mut self) {
            self.aborted = true;
        }
    }

    fn builder(lines: &[&str], sink: ScriptedSink) -> DirectBuilder<ScriptedSink> {
        DirectBuilder::new(
            Box::new(StringListSource::new(lines.iter().copied())),
            sink,
            Box::new(HaltPolicy(OptionalHaltPolicy::Continue)),
        )
    }

    fn run(builder: &mut DirectBuilder<ScriptedSink>) {
        for _ in 0..100 {
            if builder.is_finished().unwrap() {
                return;
            }
            builder.advance_one_step().unwrap();
        }
        panic!("build did not finish");
    }

    #[test]
    fn test_retryable_failure_does_not_advance() {
        let sink = ScriptedSink {
            fail_on: Some("G1 X2".to_string()),
            ..Default::default()
        };
        let mut builder = builder(&["G1 X1", "G1 X2", "G1 X3"], sink);

        builder.advance_one_step().unwrap();
        assert_eq!(builder.lines_processed(), 1);

        let err = builder.advance_one_step().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(builder.lines_processed(), 1);
        assert!(!builder.is_finished().unwrap());

        builder.advance_one_step().unwrap();
        assert_eq!(builder.lines_processed(), 2);

        run(&mut builder);
        assert_eq!(builder.lines_processed(), 3);
        assert_eq!(builder.sink().accepted, vec!["G1 X1", "G1 X2", "G1 X3"]);
        assert!(builder.sink().completed);
    }

    #[test]
    fn test_comment_lines_count_as_processed() {
        let mut builder = builder(&["; header", "G28", ""], ScriptedSink::default());
        run(&mut builder);
        assert_eq!(builder.lines_processed(), 3);
        assert_eq!(builder.lines_total(), Some(3));
        assert_eq!(builder.sink().accepted, vec!["G28"]);
    }

    #[test]
    fn test_program_end_finishes_without_error() {
        let mut builder = builder(&["G28", "M2", "G1 X1"], ScriptedSink::default());
        run(&mut builder);
        assert_eq!(builder.sink().accepted, vec!["G28"]);
        assert_eq!(builder.lines_processed(), 1);
    }

    #[test]
    fn test_unconditional_halt_finishes() {
        let mut builder = builder(&["M0", "G28"], ScriptedSink::default());
        builder.advance_one_step().unwrap();
        assert!(builder.is_finished().unwrap());
        assert!(builder.sink().accepted.is_empty());
    }

    #[test]
    fn test_optional_halt_follows_policy() {
        let mut continuing = builder(&["M1", "G28"], ScriptedSink::default());
        run(&mut continuing);
        assert_eq!(continuing.sink().accepted, vec!["G28"]);

        let mut stopping = DirectBuilder::new(
            Box::new(StringListSource::new(["M1", "G28"])),
            ScriptedSink::default(),
            Box::new(HaltPolicy(OptionalHaltPolicy::Stop)),
        );
        run(&mut stopping);
        assert!(stopping.sink().accepted.is_empty());
    }

    #[test]
    fn test_rewind_restarts_cursor() {
        let mut builder = builder(&["G1 X1", "M30"], ScriptedSink::default());
        builder.advance_one_step().unwrap();
        builder.advance_one_step().unwrap();
        assert_eq!(builder.lines_processed(), 0);
        assert!(!builder.is_finished().unwrap());

        builder.advance_one_step().unwrap();
        assert_eq!(builder.sink().accepted, vec!["G1 X1", "G1 X1"]);
    }

    #[test]
    fn test_abort_releases_sink() {
        let mut builder = builder(&["G28", "G1 X1"], ScriptedSink::default());
        builder.advance_one_step().unwrap();
        builder.abort();
        assert!(builder.sink().aborted);
        assert!(!builder.sink().completed);
        assert!(builder.is_finished().unwrap());
    }

    #[test]
    fn test_simulator_is_best_effort() {
        let mut builder = builder(&["G1 X10 F600", "G1 X1.2.3", "G1 X20"], ScriptedSink::default())
            .with_simulator(Box::new(MotionSimulator::new()));
        run(&mut builder);
        assert_eq!(builder.lines_processed(), 3);
        assert_eq!(builder.sink().accepted.len(), 3);
        assert!(builder.simulator().is_some());
    }

    #[test]
    fn test_fatal_sink_error_propagates() {
        struct Broken;
        impl InstructionSink for Broken {
            fn accept(&mut self, _instruction: &str) -> Result<()> {
                Err(Error::Driver(DriverError::Fault {
                    message: "Extruder Fail".to_string(),
                }))
            }
            fn is_drained(&self) -> bool {
                true
            }
            fn complete(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let mut builder = DirectBuilder::new(
            Box::new(StringListSource::new(["G28"])),
            Broken,
            Box::new(HaltPolicy(OptionalHaltPolicy::Continue)),
        );
        let err = builder.advance_one_step().unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(builder.lines_processed(), 0);
    }

    #[test]
    fn test_poll_interval_only_while_draining() {
        let mut builder = builder(&["G28"], ScriptedSink::default())
            .with_drain_poll(Duration::from_millis(25));
        assert_eq!(builder.poll_interval(), None);
        builder.advance_one_step().unwrap();
        builder.advance_one_step().unwrap();
        assert_eq!(builder.poll_interval(), Some(Duration::from_millis(25)));
    }
}
