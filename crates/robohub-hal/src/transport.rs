//! Serial wire codec between the robot board and the hub.
//!
//! # Inbound frames
//!
//! One UTF-8 line per frame, holding a JSON object with the protocol-v2
//! sensor fields.  Every field is required; unknown extra fields are
//! ignored.
//!
//! | Wire field | Label(s) |
//! |---|---|
//! | `sicaklik` | [`SensorLabel::Temperature`] |
//! | `nem` | [`SensorLabel::Humidity`] |
//! | `isikSeviyesi` | [`SensorLabel::Light`] (through [`LightTransform`]) |
//! | `mesafe` | [`SensorLabel::Distance`], [`SensorLabel::Proximity`] |
//! | `BPM` | [`SensorLabel::Pulse`] |
//! | `havaKalitesi` | [`SensorLabel::AirQuality`] |
//! | `gazSeviyesi` | [`SensorLabel::Gas`] |
//! | `hareket` | [`SensorLabel::Vibration`] |
//! | `suSeviyesi` | [`SensorLabel::Rain`] |
//!
//! # Outbound frames
//!
//! Every actuator channel as an ASCII decimal integer, comma-joined and
//! newline-terminated: `"90,45\n"`.

use robohub_types::{HubError, SensorLabel, SensorReading, TransportCommand};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Largest partial frame kept while waiting for a newline.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// How the raw light level from the board maps to [`SensorLabel::Light`].
///
/// Protocol v2 boards report darkness (0 = bright), so the pinned default
/// inverts the value.  `Raw` exists for v1 boards and must be chosen
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightTransform {
    Raw,
    #[default]
    Inverted,
}

impl LightTransform {
    pub fn apply(&self, raw: f64) -> f64 {
        match self {
            LightTransform::Raw => raw,
            LightTransform::Inverted => 100.0 - raw,
        }
    }
}

#[derive(Deserialize)]
struct WireFrame {
    sicaklik: f64,
    nem: f64,
    #[serde(rename = "isikSeviyesi")]
    isik_seviyesi: f64,
    mesafe: f64,
    #[serde(rename = "BPM")]
    bpm: f64,
    #[serde(rename = "havaKalitesi")]
    hava_kalitesi: f64,
    #[serde(rename = "gazSeviyesi")]
    gaz_seviyesi: f64,
    hareket: f64,
    #[serde(rename = "suSeviyesi")]
    su_seviyesi: f64,
}

/// Encoder/decoder for the board protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportCodec {
    light: LightTransform,
}

impl TransportCodec {
    pub fn new(light: LightTransform) -> Self {
        Self { light }
    }

    pub fn light_transform(&self) -> LightTransform {
        self.light
    }

    /// Parse one frame (without its newline).
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Protocol`] for invalid UTF-8, invalid JSON, or a
    /// missing/ill-typed field.
    pub fn decode_detailed(&self, line: &[u8]) -> Result<SensorReading, HubError> {
        let frame: WireFrame = serde_json::from_slice(line)
            .map_err(|e| HubError::Protocol(format!("malformed sensor frame: {e}")))?;

        Ok(SensorReading::from([
            (SensorLabel::Temperature, frame.sicaklik),
            (SensorLabel::Humidity, frame.nem),
            (SensorLabel::Light, self.light.apply(frame.isik_seviyesi)),
            (SensorLabel::Distance, frame.mesafe),
            (SensorLabel::Pulse, frame.bpm),
            (SensorLabel::AirQuality, frame.hava_kalitesi),
            (SensorLabel::Gas, frame.gaz_seviyesi),
            (SensorLabel::Vibration, frame.hareket),
            (SensorLabel::Rain, frame.su_seviyesi),
            (SensorLabel::Proximity, frame.mesafe),
        ]))
    }

    /// Parse one frame, returning `None` on any error.
    pub fn decode(&self, line: &[u8]) -> Option<SensorReading> {
        self.decode_detailed(line).ok()
    }

    /// Render every channel of `cmd` as one newline-terminated frame.
    pub fn encode(&self, cmd: &TransportCommand) -> Vec<u8> {
        let mut out = cmd
            .channels()
            .iter()
            .map(i32::to_string)
            .collect::<Vec<_>>()
            .join(",")
            .into_bytes();
        out.push(b'\n');
        out
    }
}

/// Decode with the pinned protocol-v2 light transform.
pub fn decode(line: &[u8]) -> Option<SensorReading> {
    TransportCodec::default().decode(line)
}

/// Encode a full multi-channel frame.
pub fn encode(cmd: &TransportCommand) -> Vec<u8> {
    TransportCodec::default().encode(cmd)
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Accumulates raw serial chunks and splits them into newline-delimited
/// frames.  Partial frames are kept until their newline arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of any size.
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() > MAX_PENDING_BYTES && !self.pending.contains(&b'\n') {
            warn!(
                discarded = self.pending.len(),
                "serial buffer overflow without a frame delimiter; discarding"
            );
            self.pending.clear();
        }
    }

    /// Next complete frame without its newline (and without a trailing
    /// `\r`), or `None` if no newline has arrived yet.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut frame: Vec<u8> = self.pending.drain(..=end).collect();
        frame.pop();
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
        Some(frame)
    }

    /// Every complete frame currently buffered.
    pub fn drain_frames(&mut self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Bytes held while waiting for a delimiter.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = r#"{"sicaklik":22.5,"nem":40,"isikSeviyesi":10,"mesafe":120,"BPM":72,"havaKalitesi":35,"gazSeviyesi":300,"hareket":0,"suSeviyesi":5}"#;

    #[test]
    fn decode_maps_fields_and_inverts_light() {
        let reading = decode(FRAME.as_bytes()).expect("valid frame");
        assert_eq!(reading[&SensorLabel::Temperature], 22.5);
        assert_eq!(reading[&SensorLabel::Humidity], 40.0);
        assert_eq!(reading[&SensorLabel::Light], 90.0);
        assert_eq!(reading[&SensorLabel::Distance], 120.0);
        assert_eq!(reading[&SensorLabel::Proximity], 120.0);
        assert_eq!(reading[&SensorLabel::Pulse], 72.0);
        assert_eq!(reading[&SensorLabel::Rain], 5.0);
        assert_eq!(reading.len(), SensorLabel::ALL.len());
    }

    #[test]
    fn raw_light_transform_is_opt_in() {
        let codec = TransportCodec::new(LightTransform::Raw);
        let reading = codec.decode(FRAME.as_bytes()).unwrap();
        assert_eq!(reading[&SensorLabel::Light], 10.0);
        assert_eq!(
            TransportCodec::default().light_transform(),
            LightTransform::Inverted
        );
    }

    #[test]
    fn invalid_json_decodes_to_none() {
        assert!(decode(b"{\"sicaklik\": 22.5,").is_none());
        assert!(decode(b"hello").is_none());
        assert!(decode(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn missing_field_is_a_protocol_error() {
        let err = TransportCodec::default()
            .decode_detailed(br#"{"sicaklik":22.5,"nem":40}"#)
            .unwrap_err();
        assert!(matches!(err, HubError::Protocol(_)));
    }

    #[test]
    fn encode_emits_all_channels() {
        let mut cmd = TransportCommand::default();
        cmd.set(0, 90).unwrap();
        cmd.set(1, 45).unwrap();
        assert_eq!(encode(&cmd), b"90,45\n");
    }

    #[test]
    fn encoded_frame_parses_back_to_channel_values() {
        let mut cmd = TransportCommand::new(3);
        cmd.set(0, 180).unwrap();
        cmd.set(2, -15).unwrap();
        let frame = encode(&cmd);
        let text = std::str::from_utf8(&frame).unwrap().trim_end();
        let values: Vec<i32> = text.split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(values, cmd.channels());
    }

    #[test]
    fn frame_buffer_waits_for_newline() {
        let mut buf = FrameBuffer::new();
        buf.push(b"{\"sicak");
        assert!(buf.next_frame().is_none());
        buf.push(b"lik\":1}\n{\"ne");
        assert_eq!(buf.next_frame().unwrap(), b"{\"sicaklik\":1}");
        assert!(buf.next_frame().is_none());
        assert_eq!(buf.pending_len(), 5);
    }

    #[test]
    fn frame_buffer_splits_many_frames_and_strips_cr() {
        let mut buf = FrameBuffer::new();
        buf.push(b"a\r\nb\nc");
        assert_eq!(buf.drain_frames(), vec![b"a".to_vec(), b"b".to_vec()]);
        buf.push(b"\n");
        assert_eq!(buf.drain_frames(), vec![b"c".to_vec()]);
    }

    #[test]
    fn frame_buffer_discards_runaway_garbage() {
        let mut buf = FrameBuffer::new();
        buf.push(&vec![b'x'; MAX_PENDING_BYTES + 1]);
        assert_eq!(buf.pending_len(), 0);
    }
}
