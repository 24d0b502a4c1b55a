//! Simulated input devices
//!
//! Each simulated device is a producer thread that samples at the runtime's
//! polling frequency (or as fast as it can) and queues events carrying a
//! per-device sequence number followed by random bytes. Sequence numbers let
//! the scenario harness check ordering and completeness on the consumer side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use tactile_core::{
    event_types, CommandInfo, CommandResult, DeviceCommand, DeviceId, FourCC, QueryEnabled,
    QuerySamplingFrequency, RequestReset, SetRumble, TactileError, TactileResult,
};
use tactile_runtime::{CommandHandler, DeviceAnnouncer, EventSender};

use crate::{SimulationError, SimulationResult};

/// Bytes at the start of every simulated payload holding the sequence number
pub const SEQ_LEN: usize = 4;

/// How a simulated device spaces its samples
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pacing {
    /// Sleep one polling interval between samples
    Polled,
    /// No sleeping at all
    Burst,
}

/// Simulated device configuration
#[derive(Clone, Debug)]
pub struct SimulatedDeviceConfig {
    /// Product name used in the description
    pub product: String,
    pub event_type: FourCC,
    /// Payload bytes per event, sequence number included
    pub payload_len: usize,
    /// Events to produce before the thread exits
    pub event_count: u32,
    pub pacing: Pacing,
    /// Wait before retrying an enqueue refused with `QueueFull`
    pub retry_backoff: Duration,
    pub seed: u64,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        Self {
            product: "Simulated Gamepad".to_string(),
            event_type: event_types::STATE,
            payload_len: 16,
            event_count: 100,
            pacing: Pacing::Burst,
            retry_backoff: Duration::from_micros(50),
            seed: 0,
        }
    }
}

impl SimulatedDeviceConfig {
    pub fn with_events(mut self, event_count: u32) -> Self {
        self.event_count = event_count;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// JSON description announced for the device
    pub fn description(&self) -> String {
        format!(
            r#"{{"interface":"Simulated","product":"{}","format":"{}"}}"#,
            self.product, self.event_type
        )
    }
}

/// What one producer thread did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub device: DeviceId,
    /// Events accepted by the queue
    pub sent: u32,
    /// Enqueues refused with `QueueFull` and retried
    pub retries: u64,
    /// True if the thread stopped early (stop flag or shutdown)
    pub stopped_early: bool,
}

/// Sequence number carried by a simulated payload
pub fn payload_seq(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; SEQ_LEN] = payload.get(..SEQ_LEN)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

struct RunningDevice {
    device: DeviceId,
    pad: SimulatedPad,
    handle: JoinHandle<TactileResult<ProducerReport>>,
}

/// Runs simulated devices against a runtime's producer handles
pub struct DeviceSimulator {
    sender: EventSender,
    announcer: DeviceAnnouncer,
    stop: Arc<AtomicBool>,
    running: Vec<RunningDevice>,
}

impl DeviceSimulator {
    pub fn new(sender: EventSender, announcer: DeviceAnnouncer) -> Self {
        DeviceSimulator {
            sender,
            announcer,
            stop: Arc::new(AtomicBool::new(false)),
            running: Vec::new(),
        }
    }

    /// Discover a device, attach a simulated command handler and start its
    /// producer thread
    pub fn spawn(&mut self, config: SimulatedDeviceConfig) -> SimulationResult<DeviceId> {
        let pad = SimulatedPad::new();
        let device = self
            .announcer
            .discover_with_commands(config.description(), pad.clone())?;

        let sender = self.sender.clone();
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::Builder::new()
            .name(format!("sim-device-{}", device))
            .spawn(move || produce(device, config, sender, stop))?;

        debug!(device = device.0, "simulated device started");
        self.running.push(RunningDevice { device, pad, handle });
        Ok(device)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.running.iter().map(|running| running.device).collect()
    }

    /// Command handler state of a spawned device
    pub fn pad(&self, device: DeviceId) -> Option<&SimulatedPad> {
        self.running
            .iter()
            .find(|running| running.device == device)
            .map(|running| &running.pad)
    }

    /// Ask every producer to stop after its current sample
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for every producer thread to finish
    pub fn join(self) -> SimulationResult<Vec<ProducerReport>> {
        let mut reports = Vec::with_capacity(self.running.len());
        for running in self.running {
            let device = running.device;
            let report = running
                .handle
                .join()
                .map_err(|_| SimulationError::ProducerPanicked(device))??;
            reports.push(report);
        }
        Ok(reports)
    }
}

fn produce(
    device: DeviceId,
    config: SimulatedDeviceConfig,
    sender: EventSender,
    stop: Arc<AtomicBool>,
) -> TactileResult<ProducerReport> {
    let mut rng = StdRng::seed_from_u64(config.seed ^ u64::from(device.0));
    let mut payload = vec![0u8; config.payload_len.max(SEQ_LEN)];
    let mut report = ProducerReport {
        device,
        ..Default::default()
    };

    for seq in 0..config.event_count {
        payload[..SEQ_LEN].copy_from_slice(&seq.to_le_bytes());
        rng.fill(&mut payload[SEQ_LEN..]);

        loop {
            if stop.load(Ordering::Acquire) {
                report.stopped_early = true;
                return Ok(report);
            }
            match sender.send(device, config.event_type, &payload) {
                Ok(id) => {
                    trace!(device = device.0, seq, event = id.0, "simulated sample queued");
                    report.sent += 1;
                    break;
                }
                Err(TactileError::QueueFull { .. }) => {
                    report.retries += 1;
                    std::thread::sleep(config.retry_backoff);
                }
                Err(TactileError::Shutdown) => {
                    report.stopped_early = true;
                    return Ok(report);
                }
                Err(e) => return Err(e),
            }
        }

        if config.pacing == Pacing::Polled {
            std::thread::sleep(sender.polling_interval());
        }
    }
    Ok(report)
}

/// State of a simulated pad, as seen through its command handler
#[derive(Clone, Debug, PartialEq)]
pub struct PadState {
    pub enabled: bool,
    pub rumble: SetRumble,
    pub sampling_frequency: f32,
    pub resets: u32,
}

impl Default for PadState {
    fn default() -> Self {
        Self {
            enabled: true,
            rumble: SetRumble::default(),
            sampling_frequency: 60.0,
            resets: 0,
        }
    }
}

/// Command handler answering the standard commands
#[derive(Clone, Debug, Default)]
pub struct SimulatedPad {
    state: Arc<Mutex<PadState>>,
}

impl SimulatedPad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PadState {
        self.state.lock().clone()
    }
}

impl CommandHandler for SimulatedPad {
    fn execute(&mut self, command: &mut DeviceCommand) -> CommandResult {
        let mut state = self.state.lock();
        let outcome = match command.command_type() {
            t if t == SetRumble::TYPE => command.read_typed::<SetRumble>().map(|rumble| {
                state.rumble = rumble;
            }),
            t if t == QueryEnabled::TYPE => command.write_typed(&QueryEnabled {
                enabled: state.enabled,
            }),
            t if t == QuerySamplingFrequency::TYPE => {
                command.write_typed(&QuerySamplingFrequency {
                    frequency: state.sampling_frequency,
                })
            }
            t if t == RequestReset::TYPE => {
                let resets = state.resets + 1;
                *state = PadState {
                    resets,
                    ..PadState::default()
                };
                Ok(())
            }
            _ => return CommandResult::UNSUPPORTED,
        };
        match outcome {
            Ok(()) => CommandResult::SUCCESS,
            Err(_) => CommandResult::FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tactile_runtime::{InputRuntime, RuntimeConfig};

    #[test]
    fn test_payload_seq() {
        assert_eq!(payload_seq(&[7, 0, 0, 0, 99]), Some(7));
        assert_eq!(payload_seq(&[1, 2]), None);
    }

    #[test]
    fn test_description_is_json() {
        let config = SimulatedDeviceConfig::default();
        assert_eq!(
            config.description(),
            r#"{"interface":"Simulated","product":"Simulated Gamepad","format":"STAT"}"#
        );
    }

    #[test]
    fn test_simulated_pad_commands() {
        let mut pad = SimulatedPad::new();
        let rumble = SetRumble {
            low_frequency: 0.3,
            high_frequency: 0.6,
        };

        let mut command = DeviceCommand::from_typed(&rumble);
        assert_eq!(pad.execute(&mut command), CommandResult::SUCCESS);
        assert_eq!(pad.state().rumble, rumble);

        let mut query = DeviceCommand::from_typed(&QuerySamplingFrequency::default());
        assert_eq!(pad.execute(&mut query), CommandResult::SUCCESS);
        assert_eq!(query.read_typed::<QuerySamplingFrequency>().unwrap().frequency, 60.0);

        let mut reset = DeviceCommand::from_typed(&RequestReset);
        assert_eq!(pad.execute(&mut reset), CommandResult::SUCCESS);
        assert_eq!(pad.state().rumble, SetRumble::default());
        assert_eq!(pad.state().resets, 1);

        let mut truncated = DeviceCommand::new(SetRumble::TYPE, 2);
        assert_eq!(pad.execute(&mut truncated), CommandResult::FAILURE);

        let mut unknown = DeviceCommand::new(FourCC::new(b"CALB"), 0);
        assert_eq!(pad.execute(&mut unknown), CommandResult::UNSUPPORTED);
    }

    #[test]
    fn test_producers_stop_on_shutdown() {
        let runtime = InputRuntime::new(RuntimeConfig::default()).unwrap();
        let mut simulator = DeviceSimulator::new(runtime.sender(), runtime.announcer());
        simulator
            .spawn(
                SimulatedDeviceConfig::default()
                    .with_events(u32::MAX)
                    .with_pacing(Pacing::Polled),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        runtime.shutdown().unwrap();

        let reports = simulator.join().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].stopped_early);
    }
}
