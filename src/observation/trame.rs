//! Framed observation messages and their wire form.
//!
//! A trame stream is self-delimited over any byte stream: each trame is a
//! one-byte kind tag, a big-endian `u32` payload length, then the payload
//! (the serde_json encoding of the trame body). Malformed input surfaces as
//! [`ProtocolError`]; by policy a protocol error detaches the offending view
//! but never stops the simulation.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

/// Largest accepted payload, a guard against corrupt length prefixes.
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Errors on the observation wire.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("observation I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed trame payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown trame tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("trame tag `{tag}` does not match payload kind `{kind}`")]
    TagMismatch { tag: char, kind: &'static str },

    #[error("trame payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte limit")]
    Oversized(u32),
}

/// One observed sample inside a `value` trame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSample {
    /// Path of the coupled model containing the simulator.
    pub parent: String,
    /// Name of the observed atomic model.
    pub simulator: String,
    /// The observed port or state-variable name.
    pub port: String,
    /// The sampled payload.
    pub value: Value,
}

/// A framed message on the observation bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trame {
    /// View setup: the plugin's location / parameter string.
    Parameter { view: String, data: String },
    /// A column joins the view.
    NewObservable {
        view: String,
        parent: String,
        simulator: String,
        port: String,
    },
    /// A column leaves the view.
    DelObservable {
        view: String,
        parent: String,
        simulator: String,
        port: String,
    },
    /// A timestamped batch of samples.
    Value {
        view: String,
        time: f64,
        items: Vec<ModelSample>,
    },
    /// End of stream for the view.
    End { view: String, time: f64 },
}

impl Trame {
    /// The one-byte wire tag of this trame kind.
    pub fn tag(&self) -> u8 {
        match self {
            Trame::Parameter { .. } => b'P',
            Trame::NewObservable { .. } => b'N',
            Trame::DelObservable { .. } => b'D',
            Trame::Value { .. } => b'V',
            Trame::End { .. } => b'E',
        }
    }

    /// The view this trame belongs to.
    pub fn view(&self) -> &str {
        match self {
            Trame::Parameter { view, .. }
            | Trame::NewObservable { view, .. }
            | Trame::DelObservable { view, .. }
            | Trame::Value { view, .. }
            | Trame::End { view, .. } => view,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Trame::Parameter { .. } => "parameter",
            Trame::NewObservable { .. } => "new_observable",
            Trame::DelObservable { .. } => "del_observable",
            Trame::Value { .. } => "value",
            Trame::End { .. } => "end",
        }
    }
}

/// Writes one framed trame.
pub fn write_trame<W: Write>(writer: &mut W, trame: &Trame) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(trame)?;
    let len = payload.len() as u32;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::Oversized(len));
    }
    writer.write_all(&[trame.tag()])?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Reads one framed trame; `Ok(None)` on a clean end of stream.
pub fn read_trame<R: Read>(reader: &mut R) -> Result<Option<Trame>, ProtocolError> {
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    if !matches!(tag[0], b'P' | b'N' | b'D' | b'V' | b'E') {
        return Err(ProtocolError::UnknownTag(tag[0]));
    }

    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len);
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::Oversized(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    let trame: Trame = serde_json::from_slice(&payload)?;
    if trame.tag() != tag[0] {
        return Err(ProtocolError::TagMismatch {
            tag: tag[0] as char,
            kind: trame.kind_name(),
        });
    }
    Ok(Some(trame))
}
