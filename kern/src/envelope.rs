//! Structured text envelope codec (component G).
//!
//! Tunnels carry NUL-terminated JSON text, optionally followed by a binary
//! appendix starting at the first byte after the NUL. We lean on
//! `serde_json::Value` as the typed-leaf value model: a payload leaf is
//! either a bare JSON string (the literal printable bytes)
//! or a `{"hex": "..."}` object (non-printable bytes, hex-encoded inline),
//! or, when the peer supports binary extras, `{"hex": "", "length": N}`
//! meaning "read N raw bytes from the appendix".
//!
//! `preodic` is spelled as shown in the wire format on purpose -- it has to
//! round-trip with peers that expect exactly that key.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use abi::Error;
use serde_json::{json, Value};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum EnvelopeEvent {
    /// Inbound text didn't parse as any known envelope shape; dropped.
    Malformed { len: u16 },
}

ringbuf::ringbuf!(EnvelopeEvent, 16, EnvelopeEvent::Malformed { len: 0 });

/// An envelope ready to go out on a tunnel: JSON text plus an optional
/// binary appendix. Framing (appending the NUL and appendix) is the
/// tunnel's job; this type keeps them separate so callers can measure
/// lengths without scanning for the NUL themselves.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EncodedEnvelope {
    pub text: String,
    pub binary_appendix: Vec<u8>,
}

impl EncodedEnvelope {
    fn text_only(text: String) -> Self {
        EncodedEnvelope { text, binary_appendix: Vec::new() }
    }

    /// Serializes to the wire form: text, a NUL, then the appendix.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.text.len() + 1 + self.binary_appendix.len());
        out.extend_from_slice(self.text.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.binary_appendix);
        out
    }
}

/// A decoded `msg` envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MsgEnvelope {
    pub targ_task: String,
    pub notify: String,
    pub data: Vec<u8>,
    pub src_task: Option<String>,
    pub timer: Option<TimerFields>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimerFields {
    pub delay_ms: i32,
    pub periodic_ms: i32,
    pub count: i32,
}

/// One core's entry in a topology (`Cores`) envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoreEntry {
    pub name: String,
    pub jump: u32,
    pub supports_json_extra: bool,
    pub tasks: Vec<String>,
}

/// One region's entry in an `mmap` push envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MmapRegionEntry {
    pub name: String,
    pub src_core: String,
    pub dst_core: String,
    pub mem_size: u32,
    pub mem_data: Vec<u8>,
}

/// Any of the four envelope shapes a tunnel can carry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Envelope {
    Msg(MsgEnvelope),
    Cores(Vec<CoreEntry>),
    Mmap(Vec<MmapRegionEntry>),
    MmapSyncReq { src_core: String, dst_core: String },
}

fn is_printable_ascii(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(|&b| (0x20..=0x7e).contains(&b))
        || bytes.is_empty()
}

/// Encodes a byte payload as either a bare JSON string (printable) or a
/// `{"hex": "..."}` object (anything else).
fn encode_bytes_leaf(bytes: &[u8]) -> Value {
    if is_printable_ascii(bytes) {
        match core::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => json!({ "hex": hex::encode(bytes) }),
        }
    } else {
        json!({ "hex": hex::encode(bytes) })
    }
}

/// Encodes a byte payload as a zero-length hex marker, for peers that will
/// read the real bytes from the binary appendix instead.
fn encode_appendix_marker(length: usize) -> Value {
    json!({ "hex": "", "length": length })
}

fn decode_bytes_leaf(v: &Value) -> Result<Vec<u8>, Error> {
    match v {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Object(map) => {
            let hex_str = map
                .get("hex")
                .and_then(Value::as_str)
                .ok_or(Error::MalformedEnvelope)?;
            hex::decode(hex_str).map_err(|_| Error::MalformedEnvelope)
        }
        _ => Err(Error::MalformedEnvelope),
    }
}

/// True if `v` is the zero-length hex marker meaning "read from appendix",
/// and if so, the declared length.
fn appendix_marker_length(v: &Value) -> Option<usize> {
    let map = v.as_object()?;
    let hex_str = map.get("hex")?.as_str()?;
    if !hex_str.is_empty() {
        return None;
    }
    map.get("length")?.as_u64().map(|n| n as usize)
}

/// Builds a `msg` envelope. If `payload` is non-printable and the peer does
/// not support binary extras, it is hex-encoded inline; if the peer does
/// support extras, the envelope carries a zero-length marker and the real
/// bytes ride along as a binary appendix.
pub fn encode_msg(
    targ_task: &str,
    notify: &str,
    payload: &[u8],
    src_task: Option<&str>,
    timer: Option<TimerFields>,
    peer_supports_json_extra: bool,
) -> EncodedEnvelope {
    let mut msg = serde_json::Map::new();
    msg.insert("targ_task".into(), Value::String(targ_task.to_string()));
    msg.insert("notify".into(), Value::String(notify.to_string()));

    let printable = is_printable_ascii(payload)
        && core::str::from_utf8(payload).is_ok()
        && !payload.is_empty();
    let mut appendix = Vec::new();
    if printable {
        msg.insert("data".into(), encode_bytes_leaf(payload));
    } else if peer_supports_json_extra {
        msg.insert("data".into(), encode_appendix_marker(payload.len()));
        appendix.extend_from_slice(payload);
    } else {
        msg.insert("data".into(), encode_bytes_leaf(payload));
    }

    if let Some(s) = src_task {
        msg.insert("src_task".into(), Value::String(s.to_string()));
    }
    if let Some(t) = timer {
        msg.insert("timer".into(), Value::String("enable".into()));
        msg.insert("delay".into(), json!(t.delay_ms));
        msg.insert("preodic".into(), json!(t.periodic_ms));
        msg.insert("cnt".into(), json!(t.count));
    }

    let mut top = serde_json::Map::new();
    top.insert("msg".into(), Value::Object(msg));
    EncodedEnvelope {
        text: Value::Object(top).to_string(),
        binary_appendix: appendix,
    }
}

pub fn encode_cores(local_name: &str, entries: &[CoreEntry]) -> EncodedEnvelope {
    let mut top = serde_json::Map::new();
    let mut names: Vec<Value> = Vec::with_capacity(entries.len() + 1);
    names.push(Value::String(local_name.to_string()));
    for e in entries {
        names.push(Value::String(e.name.clone()));
        top.insert(
            e.name.clone(),
            json!({
                "Jump": e.jump,
                "SupportJsonExtra": e.supports_json_extra,
                "TaskArray": e.tasks,
            }),
        );
    }
    top.insert("Cores".into(), Value::Array(names));
    EncodedEnvelope::text_only(Value::Object(top).to_string())
}

pub fn encode_mmap(entries: &[MmapRegionEntry]) -> EncodedEnvelope {
    let mut mmap = serde_json::Map::new();
    let names: Vec<Value> = entries.iter().map(|e| Value::String(e.name.clone())).collect();
    mmap.insert("mmap_array".into(), Value::Array(names));
    for e in entries {
        mmap.insert(
            e.name.clone(),
            json!({
                "src_core": e.src_core,
                "dst_core": e.dst_core,
                "mem_size": e.mem_size,
                "mem_data": encode_bytes_leaf(&e.mem_data),
            }),
        );
    }
    let mut top = serde_json::Map::new();
    top.insert("mmap".into(), Value::Object(mmap));
    EncodedEnvelope::text_only(Value::Object(top).to_string())
}

pub fn encode_mmap_sync_req(src_core: &str, dst_core: &str) -> EncodedEnvelope {
    EncodedEnvelope::text_only(
        json!({ "mmap_sync_req": { "src_core": src_core, "dst_core": dst_core } })
            .to_string(),
    )
}

/// Parses a decoded envelope. `text` must not include the terminating NUL;
/// `appendix` is whatever bytes followed it on the wire (may be empty).
pub fn decode(text: &str, appendix: &[u8]) -> Result<Envelope, Error> {
    let result = decode_inner(text, appendix);
    if result.is_err() {
        ringbuf::ringbuf_entry!(EnvelopeEvent::Malformed { len: text.len() as u16 });
    }
    result
}

fn decode_inner(text: &str, appendix: &[u8]) -> Result<Envelope, Error> {
    let top: Value = serde_json::from_str(text).map_err(|_| Error::MalformedEnvelope)?;
    let top = top.as_object().ok_or(Error::MalformedEnvelope)?;

    if let Some(msg) = top.get("msg") {
        return decode_msg(msg, appendix);
    }
    if let Some(req) = top.get("mmap_sync_req") {
        let src_core = req
            .get("src_core")
            .and_then(Value::as_str)
            .ok_or(Error::MalformedEnvelope)?
            .to_string();
        let dst_core = req
            .get("dst_core")
            .and_then(Value::as_str)
            .ok_or(Error::MalformedEnvelope)?
            .to_string();
        return Ok(Envelope::MmapSyncReq { src_core, dst_core });
    }
    if let Some(mmap) = top.get("mmap") {
        return decode_mmap(mmap);
    }
    if top.contains_key("Cores") {
        return decode_cores(top);
    }
    Err(Error::MalformedEnvelope)
}

fn decode_msg(msg: &Value, appendix: &[u8]) -> Result<Envelope, Error> {
    let targ_task = msg
        .get("targ_task")
        .and_then(Value::as_str)
        .ok_or(Error::MalformedEnvelope)?
        .to_string();
    let notify = msg
        .get("notify")
        .and_then(Value::as_str)
        .ok_or(Error::MalformedEnvelope)?
        .to_string();
    let data_value = msg.get("data").ok_or(Error::MalformedEnvelope)?;
    let data = if let Some(len) = appendix_marker_length(data_value) {
        if appendix.len() < len {
            return Err(Error::SizeMismatch);
        }
        appendix[..len].to_vec()
    } else {
        decode_bytes_leaf(data_value)?
    };
    let src_task = msg.get("src_task").and_then(Value::as_str).map(String::from);
    let timer = if msg.get("timer").and_then(Value::as_str) == Some("enable") {
        Some(TimerFields {
            delay_ms: msg.get("delay").and_then(Value::as_i64).unwrap_or(0) as i32,
            periodic_ms: msg.get("preodic").and_then(Value::as_i64).unwrap_or(0) as i32,
            count: msg.get("cnt").and_then(Value::as_i64).unwrap_or(0) as i32,
        })
    } else {
        None
    };
    Ok(Envelope::Msg(MsgEnvelope { targ_task, notify, data, src_task, timer }))
}

fn decode_cores(top: &serde_json::Map<String, Value>) -> Result<Envelope, Error> {
    let names = top
        .get("Cores")
        .and_then(Value::as_array)
        .ok_or(Error::MalformedEnvelope)?;
    let mut entries = Vec::with_capacity(names.len());
    for n in names {
        let name = n.as_str().ok_or(Error::MalformedEnvelope)?;
        let Some(detail) = top.get(name) else {
            // The local core's own name has no detail object (it just
            // appears in the list); skip it.
            continue;
        };
        let jump = detail.get("Jump").and_then(Value::as_u64).unwrap_or(0) as u32;
        let supports_json_extra = detail
            .get("SupportJsonExtra")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let tasks = detail
            .get("TaskArray")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        entries.push(CoreEntry { name: name.to_string(), jump, supports_json_extra, tasks });
    }
    Ok(Envelope::Cores(entries))
}

fn decode_mmap(mmap: &Value) -> Result<Envelope, Error> {
    let mmap = mmap.as_object().ok_or(Error::MalformedEnvelope)?;
    let names = mmap
        .get("mmap_array")
        .and_then(Value::as_array)
        .ok_or(Error::MalformedEnvelope)?;
    let mut entries = Vec::with_capacity(names.len());
    for n in names {
        let name = n.as_str().ok_or(Error::MalformedEnvelope)?;
        let detail = mmap.get(name).ok_or(Error::MalformedEnvelope)?;
        let src_core = detail
            .get("src_core")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let dst_core = detail
            .get("dst_core")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let mem_size = detail.get("mem_size").and_then(Value::as_u64).unwrap_or(0) as u32;
        let mem_data = detail
            .get("mem_data")
            .map(decode_bytes_leaf)
            .transpose()?
            .unwrap_or_default();
        entries.push(MmapRegionEntry {
            name: name.to_string(),
            src_core,
            dst_core,
            mem_size,
            mem_data,
        });
    }
    Ok(Envelope::Mmap(entries))
}
