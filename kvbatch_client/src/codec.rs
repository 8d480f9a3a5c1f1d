//! Wire format of requests and responses.
//!
//! Every message is a frame: an 8 byte big-endian header followed by the body.
//!
//! ```text
//! +---------+------+---------------------------+
//! | version | type | body length (48 bits)     |
//! +---------+------+---------------------------+
//! ```
//!
//! A response is a sequence of [`ResponseRow`]s that may span several frames. The final row
//! has the [`info3::LAST`] flag set and carries the request level result code instead of a
//! record.
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    key::{DIGEST_SIZE, Digest},
    policy::ConsistencyLevel,
    record::Record,
    value::{Bin, Value, particle},
};

/// Protocol version written into every header.
pub const PROTO_VERSION: u8 = 2;

/// Size of the frame header.
pub const HEADER_SIZE: usize = 8;

/// Largest body a frame can describe.
pub const MAX_BODY_SIZE: u64 = (1 << 48) - 1;

/// Read flags.
pub mod info1 {
    /// Read the record.
    pub const READ: u8 = 1;
    /// Read all bins.
    pub const GET_ALL: u8 = 1 << 1;
    /// Do not return bin data.
    pub const NOBINDATA: u8 = 1 << 5;
    /// Involve all replicas in the read.
    pub const CONSISTENCY_ALL: u8 = 1 << 6;
}

/// Write flags.
pub mod info2 {
    /// Write bins.
    pub const WRITE: u8 = 1;
    /// Delete the record.
    pub const DELETE: u8 = 1 << 1;
}

/// Response row flags.
pub mod info3 {
    /// Last row of a response.
    pub const LAST: u8 = 1;
}

/// Errors while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    Version(u8),

    #[error("unknown message type {0}")]
    MessageType(u8),

    #[error("expected a {expected:?} message but got {actual:?}")]
    UnexpectedMessage {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("frame declares {declared} body bytes but carries {actual}")]
    FrameLength { declared: u64, actual: usize },

    #[error("buffer truncated: need {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("{what} of {len} bytes does not fit the wire format")]
    TooLong { what: &'static str, len: usize },

    #[error("unknown particle type {0}")]
    ParticleType(u8),

    #[error("particle type {particle} cannot hold {len} bytes")]
    ValueLength { particle: u8, len: usize },

    #[error("invalid UTF-8 in {what}: {source}")]
    Utf8 {
        what: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("request flags {info1:#04x}/{info2:#04x} do not describe an operation")]
    Flags { info1: u8, info2: u8 },

    #[error("row position {position} is outside of the {len} requested keys")]
    BatchIndex { position: u32, len: usize },

    #[error("row digest {actual} does not match requested digest {expected}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("{0} trailing bytes after the last row")]
    TrailingBytes(usize),
}

type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Multi-key read against one namespace.
    Batch,
    /// Single record operation.
    Single,
    /// Server response.
    Response,
}

impl MessageType {
    fn code(self) -> u8 {
        match self {
            Self::Batch => 1,
            Self::Single => 2,
            Self::Response => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Batch),
            2 => Ok(Self::Single),
            3 => Ok(Self::Response),
            other => Err(ProtocolError::MessageType(other)),
        }
    }
}

/// Status code reported by the server, per row and per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u8);

impl ResultCode {
    /// Success.
    pub const OK: Self = Self(0);
    /// Unclassified server failure.
    pub const SERVER_ERROR: Self = Self(1);
    /// Record does not exist.
    pub const KEY_NOT_FOUND: Self = Self(2);
    /// Generation check failed.
    pub const GENERATION_ERROR: Self = Self(3);
    /// Bad request parameter.
    pub const PARAMETER_ERROR: Self = Self(4);
    /// Record already exists.
    pub const KEY_EXISTS: Self = Self(5);
    /// Server side timeout.
    pub const TIMEOUT: Self = Self(9);
    /// Server is overloaded.
    pub const DEVICE_OVERLOAD: Self = Self(18);
    /// Namespace is not known to the node.
    pub const NAMESPACE_NOT_FOUND: Self = Self(20);

    /// Human readable name.
    pub fn name(&self) -> &'static str {
        match *self {
            Self::OK => "ok",
            Self::SERVER_ERROR => "server error",
            Self::KEY_NOT_FOUND => "key not found",
            Self::GENERATION_ERROR => "generation error",
            Self::PARAMETER_ERROR => "parameter error",
            Self::KEY_EXISTS => "key exists",
            Self::TIMEOUT => "server timeout",
            Self::DEVICE_OVERLOAD => "device overload",
            Self::NAMESPACE_NOT_FOUND => "namespace not found",
            _ => "unknown result code",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Which part of a record a read returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadMode {
    /// Every bin.
    AllBins,
    /// Only the named bins.
    Bins(Vec<String>),
    /// Generation and expiration, no bins.
    Headers,
}

impl ReadMode {
    /// Select `bins`, or every bin when the selection is empty.
    pub fn from_bins<S: AsRef<str>>(bins: &[S]) -> Self {
        if bins.is_empty() {
            Self::AllBins
        } else {
            Self::Bins(bins.iter().map(|b| b.as_ref().to_string()).collect())
        }
    }

    fn info1(&self) -> u8 {
        match self {
            Self::AllBins => info1::READ | info1::GET_ALL,
            Self::Bins(_) => info1::READ,
            Self::Headers => info1::READ | info1::NOBINDATA,
        }
    }

    fn bin_names(&self) -> &[String] {
        match self {
            Self::Bins(names) => names,
            Self::AllBins | Self::Headers => &[],
        }
    }

    fn from_wire(info1: u8, names: Vec<String>) -> Self {
        if info1 & info1::NOBINDATA != 0 {
            Self::Headers
        } else if info1 & info1::GET_ALL != 0 {
            Self::AllBins
        } else {
            Self::Bins(names)
        }
    }

    /// Whether a bin should be part of the answer.
    pub fn selects(&self, bin: &str) -> bool {
        match self {
            Self::AllBins => true,
            Self::Bins(names) => names.iter().any(|n| n == bin),
            Self::Headers => false,
        }
    }
}

/// Read of many records of one namespace from one node.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    /// Namespace of all keys.
    pub namespace: String,
    /// Requested digests; response rows refer to them by position.
    pub digests: Vec<Digest>,
    /// Bin selection.
    pub read: ReadMode,
    /// Replica consistency.
    pub consistency: ConsistencyLevel,
    /// Server side timeout hint.
    pub timeout: Option<Duration>,
}

impl BatchRequest {
    /// Encode into a complete frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        body.put_u8(self.read.info1() | consistency_flag(self.consistency));
        body.put_u32(timeout_ms(self.timeout));
        put_str_u16(&mut body, "namespace", &self.namespace)?;
        body.put_u32(len_u32("digest list", self.digests.len())?);
        for digest in &self.digests {
            body.put_slice(digest.as_bytes());
        }
        put_names(&mut body, self.read.bin_names())?;
        encode_frame(MessageType::Batch, &body)
    }

    /// Decode a batch request body.
    pub fn decode(mut body: Bytes) -> Result<Self> {
        let flags = get_u8(&mut body)?;
        let timeout = get_u32(&mut body)?;
        let namespace = get_str_u16(&mut body, "namespace")?;
        let count = get_u32(&mut body)? as usize;
        ensure(&body, count.saturating_mul(DIGEST_SIZE))?;
        let digests = (0..count)
            .map(|_| get_digest(&mut body))
            .collect::<Result<Vec<_>>>()?;
        let names = get_names(&mut body)?;
        Ok(Self {
            namespace,
            digests,
            read: ReadMode::from_wire(flags, names),
            consistency: consistency_from_flags(flags),
            timeout: timeout_from_ms(timeout),
        })
    }
}

/// Operation of a [`SingleRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum SingleOp {
    /// Read one record.
    Read(ReadMode),
    /// Write bins, creating the record if needed.
    Write {
        /// Bins to write.
        bins: Vec<Bin>,
        /// Expiration in seconds, 0 means never.
        expiration: u32,
    },
    /// Delete the record.
    Delete,
}

/// Operation on one record.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleRequest {
    /// Namespace.
    pub namespace: String,
    /// Set name.
    pub set_name: String,
    /// Record digest.
    pub digest: Digest,
    /// What to do.
    pub op: SingleOp,
    /// Replica consistency for reads.
    pub consistency: ConsistencyLevel,
    /// Server side timeout hint.
    pub timeout: Option<Duration>,
}

impl SingleRequest {
    /// Encode into a complete frame.
    pub fn encode(&self) -> Result<Bytes> {
        let (flags1, flags2, expiration, names, bins): (u8, u8, u32, &[String], &[Bin]) =
            match &self.op {
                SingleOp::Read(read) => (
                    read.info1() | consistency_flag(self.consistency),
                    0,
                    0,
                    read.bin_names(),
                    &[],
                ),
                SingleOp::Write { bins, expiration } => (0, info2::WRITE, *expiration, &[], bins),
                SingleOp::Delete => (0, info2::DELETE, 0, &[], &[]),
            };

        let mut body = BytesMut::new();
        body.put_u8(flags1);
        body.put_u8(flags2);
        body.put_u32(timeout_ms(self.timeout));
        body.put_u32(expiration);
        put_str_u16(&mut body, "namespace", &self.namespace)?;
        put_str_u16(&mut body, "set name", &self.set_name)?;
        body.put_slice(self.digest.as_bytes());
        put_names(&mut body, names)?;
        body.put_u16(len_u16("bin list", bins.len())?);
        for bin in bins {
            put_bin(&mut body, &bin.name, &bin.value)?;
        }
        encode_frame(MessageType::Single, &body)
    }

    /// Decode a single record request body.
    pub fn decode(mut body: Bytes) -> Result<Self> {
        let flags1 = get_u8(&mut body)?;
        let flags2 = get_u8(&mut body)?;
        let timeout = get_u32(&mut body)?;
        let expiration = get_u32(&mut body)?;
        let namespace = get_str_u16(&mut body, "namespace")?;
        let set_name = get_str_u16(&mut body, "set name")?;
        let digest = get_digest(&mut body)?;
        let names = get_names(&mut body)?;
        let bin_count = get_u16(&mut body)?;
        let bins = (0..bin_count)
            .map(|_| get_bin(&mut body).map(|(name, value)| Bin { name, value }))
            .collect::<Result<Vec<_>>>()?;

        let op = if flags2 & info2::WRITE != 0 {
            SingleOp::Write { bins, expiration }
        } else if flags2 & info2::DELETE != 0 {
            SingleOp::Delete
        } else if flags1 & info1::READ != 0 {
            SingleOp::Read(ReadMode::from_wire(flags1, names))
        } else {
            return Err(ProtocolError::Flags {
                info1: flags1,
                info2: flags2,
            });
        };

        Ok(Self {
            namespace,
            set_name,
            digest,
            op,
            consistency: consistency_from_flags(flags1),
            timeout: timeout_from_ms(timeout),
        })
    }
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// See [`BatchRequest`].
    Batch(BatchRequest),
    /// See [`SingleRequest`].
    Single(SingleRequest),
}

impl Request {
    /// Decode a complete request frame, header included.
    pub fn decode_frame(frame: Bytes) -> Result<Self> {
        let (msg_type, body) = decode_frame(frame)?;
        match msg_type {
            MessageType::Batch => BatchRequest::decode(body).map(Self::Batch),
            MessageType::Single => SingleRequest::decode(body).map(Self::Single),
            MessageType::Response => Err(ProtocolError::UnexpectedMessage {
                expected: MessageType::Batch,
                actual: MessageType::Response,
            }),
        }
    }
}

/// One row of a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRow {
    /// Row or, for the last row, request status.
    pub result_code: ResultCode,
    /// Set on the final row of a response.
    pub last: bool,
    /// Record generation.
    pub generation: u32,
    /// Record expiration.
    pub expiration: u32,
    /// Position of the key within the request.
    pub batch_index: u32,
    /// Digest of the key.
    pub digest: Digest,
    /// Bins in the order the server sent them; names may repeat.
    pub bins: Vec<(String, Value)>,
}

impl ResponseRow {
    /// Terminal row carrying the request status.
    pub fn last(result_code: ResultCode) -> Self {
        Self {
            result_code,
            last: true,
            generation: 0,
            expiration: 0,
            batch_index: 0,
            digest: Digest::from_bytes([0; DIGEST_SIZE]),
            bins: vec![],
        }
    }

    /// Row for a key that has no record.
    pub fn not_found(batch_index: u32, digest: Digest) -> Self {
        Self {
            result_code: ResultCode::KEY_NOT_FOUND,
            last: false,
            generation: 0,
            expiration: 0,
            batch_index,
            digest,
            bins: vec![],
        }
    }

    /// Row for an existing record.
    pub fn found(
        batch_index: u32,
        digest: Digest,
        generation: u32,
        expiration: u32,
        bins: Vec<(String, Value)>,
    ) -> Self {
        Self {
            result_code: ResultCode::OK,
            last: false,
            generation,
            expiration,
            batch_index,
            digest,
            bins,
        }
    }

    /// Build the record carried by this row.
    pub fn into_record(self) -> Record {
        Record::from_row_bins(self.bins, self.generation, self.expiration)
    }

    /// Append the encoded row to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.result_code.0);
        buf.put_u8(if self.last { info3::LAST } else { 0 });
        buf.put_u32(self.generation);
        buf.put_u32(self.expiration);
        buf.put_u32(self.batch_index);
        buf.put_slice(self.digest.as_bytes());
        buf.put_u16(len_u16("bin list", self.bins.len())?);
        for (name, value) in &self.bins {
            put_bin(buf, name, value)?;
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let result_code = ResultCode(get_u8(buf)?);
        let flags = get_u8(buf)?;
        let generation = get_u32(buf)?;
        let expiration = get_u32(buf)?;
        let batch_index = get_u32(buf)?;
        let digest = get_digest(buf)?;
        let bin_count = get_u16(buf)?;
        let bins = (0..bin_count)
            .map(|_| get_bin(buf))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            result_code,
            last: flags & info3::LAST != 0,
            generation,
            expiration,
            batch_index,
            digest,
            bins,
        })
    }
}

/// Encode `rows` into response frames of at most `rows_per_frame` rows each.
pub fn encode_response(rows: &[ResponseRow], rows_per_frame: usize) -> Result<Vec<Bytes>> {
    rows.chunks(rows_per_frame.max(1))
        .map(|chunk| {
            let mut body = BytesMut::new();
            for row in chunk {
                row.encode(&mut body)?;
            }
            encode_frame(MessageType::Response, &body)
        })
        .collect()
}

/// Lazily decodes the rows of one response frame body.
///
/// Yields rows up to and including the [`last`](ResponseRow::last) row. Bytes after the
/// last row, and any decoding failure, yield one error and end the iteration.
#[derive(Debug)]
pub struct RowParser {
    body: Bytes,
    finished: bool,
}

impl RowParser {
    /// Parse the rows of `body`.
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            finished: false,
        }
    }

    /// Whether the last row of the response was seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Iterator for RowParser {
    type Item = Result<ResponseRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            if self.body.has_remaining() {
                let trailing = self.body.remaining();
                self.body.clear();
                return Some(Err(ProtocolError::TrailingBytes(trailing)));
            }
            return None;
        }
        if !self.body.has_remaining() {
            return None;
        }

        match ResponseRow::decode(&mut self.body) {
            Ok(row) => {
                self.finished = row.last;
                Some(Ok(row))
            }
            Err(e) => {
                self.finished = true;
                self.body.clear();
                Some(Err(e))
            }
        }
    }
}

/// Prefix `body` with a frame header.
pub fn encode_frame(msg_type: MessageType, body: &[u8]) -> Result<Bytes> {
    let len = body.len() as u64;
    if len > MAX_BODY_SIZE {
        return Err(ProtocolError::TooLong {
            what: "frame body",
            len: body.len(),
        });
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
    frame.put_u64((u64::from(PROTO_VERSION) << 56) | (u64::from(msg_type.code()) << 48) | len);
    frame.put_slice(body);
    Ok(frame.freeze())
}

/// Decode a frame header into message type and body length.
pub fn decode_header(header: [u8; HEADER_SIZE]) -> Result<(MessageType, u64)> {
    let header = u64::from_be_bytes(header);
    let version = (header >> 56) as u8;
    if version != PROTO_VERSION {
        return Err(ProtocolError::Version(version));
    }
    let msg_type = MessageType::from_code((header >> 48) as u8)?;
    Ok((msg_type, header & MAX_BODY_SIZE))
}

/// Split a complete frame into message type and body.
pub fn decode_frame(mut frame: Bytes) -> Result<(MessageType, Bytes)> {
    ensure(&frame, HEADER_SIZE)?;
    let mut header = [0; HEADER_SIZE];
    frame.copy_to_slice(&mut header);
    let (msg_type, declared) = decode_header(header)?;
    if declared != frame.len() as u64 {
        return Err(ProtocolError::FrameLength {
            declared,
            actual: frame.len(),
        });
    }
    Ok((msg_type, frame))
}

fn consistency_flag(consistency: ConsistencyLevel) -> u8 {
    match consistency {
        ConsistencyLevel::One => 0,
        ConsistencyLevel::All => info1::CONSISTENCY_ALL,
    }
}

fn consistency_from_flags(flags: u8) -> ConsistencyLevel {
    if flags & info1::CONSISTENCY_ALL != 0 {
        ConsistencyLevel::All
    } else {
        ConsistencyLevel::One
    }
}

fn timeout_ms(timeout: Option<Duration>) -> u32 {
    timeout
        .map(|t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn timeout_from_ms(ms: u32) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(u64::from(ms)))
}

fn len_u8(what: &'static str, len: usize) -> Result<u8> {
    u8::try_from(len).map_err(|_| ProtocolError::TooLong { what, len })
}

fn len_u16(what: &'static str, len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| ProtocolError::TooLong { what, len })
}

fn len_u32(what: &'static str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::TooLong { what, len })
}

fn put_str_u16(buf: &mut BytesMut, what: &'static str, s: &str) -> Result<()> {
    buf.put_u16(len_u16(what, s.len())?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_names(buf: &mut BytesMut, names: &[String]) -> Result<()> {
    buf.put_u16(len_u16("bin selection", names.len())?);
    for name in names {
        buf.put_u8(len_u8("bin name", name.len())?);
        buf.put_slice(name.as_bytes());
    }
    Ok(())
}

fn put_bin(buf: &mut BytesMut, name: &str, value: &Value) -> Result<()> {
    let payload = value.to_bytes();
    buf.put_u8(value.particle_type());
    buf.put_u8(len_u8("bin name", name.len())?);
    buf.put_slice(name.as_bytes());
    buf.put_u32(len_u32("bin value", payload.len())?);
    buf.put_slice(&payload);
    Ok(())
}

fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_digest(buf: &mut Bytes) -> Result<Digest> {
    ensure(buf, DIGEST_SIZE)?;
    let mut digest = [0; DIGEST_SIZE];
    buf.copy_to_slice(&mut digest);
    Ok(Digest::from_bytes(digest))
}

fn get_string(buf: &mut Bytes, what: &'static str, len: usize) -> Result<String> {
    ensure(buf, len)?;
    let bytes = buf.split_to(len).to_vec();
    String::from_utf8(bytes).map_err(|source| ProtocolError::Utf8 { what, source })
}

fn get_str_u16(buf: &mut Bytes, what: &'static str) -> Result<String> {
    let len = get_u16(buf)?;
    get_string(buf, what, usize::from(len))
}

fn get_names(buf: &mut Bytes) -> Result<Vec<String>> {
    let count = get_u16(buf)?;
    (0..count)
        .map(|_| {
            let len = get_u8(buf)?;
            get_string(buf, "bin name", usize::from(len))
        })
        .collect()
}

fn get_bin(buf: &mut Bytes) -> Result<(String, Value)> {
    let particle_type = get_u8(buf)?;
    let name_len = get_u8(buf)?;
    let name = get_string(buf, "bin name", usize::from(name_len))?;
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    let payload = buf.split_to(len);
    Ok((name, decode_value(particle_type, payload)?))
}

fn decode_value(particle_type: u8, mut payload: Bytes) -> Result<Value> {
    let len = payload.len();
    let fixed = |expected: usize| {
        if len == expected {
            Ok(())
        } else {
            Err(ProtocolError::ValueLength {
                particle: particle_type,
                len,
            })
        }
    };

    match particle_type {
        particle::NIL => fixed(0).map(|_| Value::Nil),
        particle::INTEGER => fixed(8).map(|_| Value::Int(payload.get_i64())),
        particle::FLOAT => fixed(8).map(|_| Value::Float(f64::from_bits(payload.get_u64()))),
        particle::STRING => String::from_utf8(payload.to_vec())
            .map(Value::String)
            .map_err(|source| ProtocolError::Utf8 {
                what: "string value",
                source,
            }),
        particle::BLOB => Ok(Value::Blob(payload.to_vec())),
        other => Err(ProtocolError::ParticleType(other)),
    }
}
