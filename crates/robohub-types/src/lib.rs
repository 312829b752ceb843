use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of sensor channels the robot firmware reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorLabel {
    Temperature,
    Humidity,
    Light,
    Distance,
    Pulse,
    AirQuality,
    Gas,
    Vibration,
    Rain,
    Proximity,
}

impl SensorLabel {
    /// Every label, in declaration order.
    pub const ALL: [SensorLabel; 10] = [
        SensorLabel::Temperature,
        SensorLabel::Humidity,
        SensorLabel::Light,
        SensorLabel::Distance,
        SensorLabel::Pulse,
        SensorLabel::AirQuality,
        SensorLabel::Gas,
        SensorLabel::Vibration,
        SensorLabel::Rain,
        SensorLabel::Proximity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorLabel::Temperature => "temperature",
            SensorLabel::Humidity => "humidity",
            SensorLabel::Light => "light",
            SensorLabel::Distance => "distance",
            SensorLabel::Pulse => "pulse",
            SensorLabel::AirQuality => "air_quality",
            SensorLabel::Gas => "gas",
            SensorLabel::Vibration => "vibration",
            SensorLabel::Rain => "rain",
            SensorLabel::Proximity => "proximity",
        }
    }
}

impl fmt::Display for SensorLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest value per sensor label. Partial readings are valid.
pub type SensorReading = BTreeMap<SensorLabel, f64>;

/// Identifies the plugin instance a command or status update originates from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    /// Directory name of the plugin; unique within one hub session.
    pub module_id: String,
    pub author: String,
    pub title: String,
}

impl Identifier {
    pub fn new(
        module_id: impl Into<String>,
        author: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            author: author.into(),
            title: title.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.title, self.author)
    }
}

/// Actions a plugin may request from the hub.
///
/// On the worker wire the variant is carried in a `verb` field and its
/// argument in `value`:
///
/// ```
/// use robohub_types::Verb;
///
/// let verb: Verb = serde_json::from_str(r#"{"verb":"state","value":"sunny"}"#).unwrap();
/// assert_eq!(verb, Verb::SetState("sunny".into()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", content = "value")]
pub enum Verb {
    /// Replace the plugin's displayed status.
    #[serde(rename = "state")]
    SetState(String),
    /// Append a line to the shared message log.
    #[serde(rename = "message")]
    SendMessage(String),
    /// Move one servo channel to an absolute angle.
    #[serde(rename = "motor_angle")]
    SetMotorAngle { channel: u8, degrees: i32 },
    /// Free-form event forwarded to the generic event sink.
    #[serde(rename = "event")]
    Event {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl Verb {
    /// Wire names of every verb the hub understands.
    pub const WIRE_NAMES: [&'static str; 4] = ["state", "message", "motor_angle", "event"];

    pub fn is_known(wire_name: &str) -> bool {
        Self::WIRE_NAMES.contains(&wire_name)
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            Verb::SetState(_) => "state",
            Verb::SendMessage(_) => "message",
            Verb::SetMotorAngle { .. } => "motor_angle",
            Verb::Event { .. } => "event",
        }
    }
}

/// A plugin-issued action tagged with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub origin: Identifier,
    #[serde(flatten)]
    pub verb: Verb,
}

impl Command {
    pub fn new(origin: Identifier, verb: Verb) -> Self {
        Self { origin, verb }
    }
}

/// Worker lifecycle. Transitions only move forward; a stopped or errored
/// plugin is never resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleLifecycleState {
    Starting,
    InstallingDependencies,
    Loading,
    Running,
    Stopped,
    Errored,
}

impl ModuleLifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidTransition`] when `next` is not strictly
    /// ahead of the current state or the current state is terminal.
    pub fn advance(&mut self, next: ModuleLifecycleState) -> Result<(), HubError> {
        if self.is_terminal() || next <= *self {
            return Err(HubError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::InstallingDependencies => "installing dependencies",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for ModuleLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Number of servo channels on the reference board.
pub const DEFAULT_CHANNEL_COUNT: usize = 2;

/// Last actuator target of every channel.
///
/// The wire format carries all channels on every write, so updating one
/// channel keeps the previously known values of the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCommand {
    channels: Vec<i32>,
}

impl TransportCommand {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channels: vec![0; channel_count],
        }
    }

    /// Set one channel, keeping the others.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ChannelOutOfRange`] for a channel the board does
    /// not have.
    pub fn set(&mut self, channel: u8, degrees: i32) -> Result<(), HubError> {
        let count = self.channels.len();
        match self.channels.get_mut(usize::from(channel)) {
            Some(slot) => {
                *slot = degrees;
                Ok(())
            }
            None => Err(HubError::ChannelOutOfRange { channel, count }),
        }
    }

    pub fn get(&self, channel: u8) -> Option<i32> {
        self.channels.get(usize::from(channel)).copied()
    }

    pub fn channels(&self) -> &[i32] {
        &self.channels
    }
}

impl Default for TransportCommand {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_COUNT)
    }
}

/// Hub-wide error type.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("unknown command verb {verb:?} from {origin}")]
    UnknownVerb { origin: Identifier, verb: String },

    #[error("worker(s) died: {}", modules.join(", "))]
    WorkerDeath { modules: Vec<String> },

    #[error("dependency installation failed for {module}: {detail}")]
    DependencyInstall { module: String, detail: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: ModuleLifecycleState,
        to: ModuleLifecycleState,
    },

    #[error("no plugin {0} is registered")]
    UnknownModule(String),

    #[error("motor channel {channel} out of range (board has {count})")]
    ChannelOutOfRange { channel: u8, count: usize },

    #[error("failed to start worker for {module}: {source}")]
    Spawn {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("test {test} depends on undeclared test {dependency}")]
    UnknownDependency { test: String, dependency: String },

    #[error("test {0} is already registered")]
    DuplicateTest(String),

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Identifier {
        Identifier::new("weather", "Ada", "Forecaster")
    }

    #[test]
    fn verb_wire_format_uses_short_names() {
        let verb = Verb::SetMotorAngle {
            channel: 1,
            degrees: 45,
        };
        let json = serde_json::to_value(&verb).unwrap();
        assert_eq!(json["verb"], "motor_angle");
        assert_eq!(json["value"]["channel"], 1);
        assert_eq!(json["value"]["degrees"], 45);
    }

    #[test]
    fn event_payload_defaults_to_null() {
        let verb: Verb =
            serde_json::from_str(r#"{"verb":"event","value":{"name":"blink"}}"#).unwrap();
        assert_eq!(
            verb,
            Verb::Event {
                name: "blink".into(),
                payload: serde_json::Value::Null
            }
        );
    }

    #[test]
    fn unknown_verb_is_rejected_by_serde() {
        let res: Result<Verb, _> = serde_json::from_str(r#"{"verb":"dance","value":1}"#);
        assert!(res.is_err());
        assert!(!Verb::is_known("dance"));
        assert!(Verb::is_known("message"));
    }

    #[test]
    fn command_flattens_verb() {
        let cmd = Command::new(origin(), Verb::SendMessage("hi".into()));
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["verb"], "message");
        assert_eq!(json["origin"]["module_id"], "weather");
    }

    #[test]
    fn identifier_display() {
        assert_eq!(origin().to_string(), "Forecaster (Ada)");
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let mut state = ModuleLifecycleState::Starting;
        state
            .advance(ModuleLifecycleState::InstallingDependencies)
            .unwrap();
        state.advance(ModuleLifecycleState::Running).unwrap();
        assert!(matches!(
            state.advance(ModuleLifecycleState::Loading),
            Err(HubError::InvalidTransition { .. })
        ));
        state.advance(ModuleLifecycleState::Stopped).unwrap();
        assert!(state.is_terminal());
        assert!(state.advance(ModuleLifecycleState::Errored).is_err());
    }

    #[test]
    fn lifecycle_rejects_self_transition() {
        let mut state = ModuleLifecycleState::Loading;
        assert!(state.advance(ModuleLifecycleState::Loading).is_err());
        assert_eq!(state, ModuleLifecycleState::Loading);
    }

    #[test]
    fn transport_command_merges_channels() {
        let mut cmd = TransportCommand::default();
        cmd.set(0, 90).unwrap();
        cmd.set(1, 45).unwrap();
        cmd.set(0, 10).unwrap();
        assert_eq!(cmd.channels(), &[10, 45]);
    }

    #[test]
    fn transport_command_rejects_unknown_channel() {
        let mut cmd = TransportCommand::new(2);
        let err = cmd.set(2, 30).unwrap_err();
        assert!(matches!(
            err,
            HubError::ChannelOutOfRange {
                channel: 2,
                count: 2
            }
        ));
        assert_eq!(cmd.channels(), &[0, 0]);
    }

    #[test]
    fn hub_error_display() {
        let err = HubError::WorkerDeath {
            modules: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "worker(s) died: a, b");

        let err = HubError::UnknownVerb {
            origin: origin(),
            verb: "dance".into(),
        };
        assert!(err.to_string().contains("Forecaster (Ada)"));
    }

    #[test]
    fn sensor_labels_serialize_snake_case() {
        let json = serde_json::to_string(&SensorLabel::AirQuality).unwrap();
        assert_eq!(json, "\"air_quality\"");
        assert_eq!(SensorLabel::ALL.len(), 10);
    }
}
