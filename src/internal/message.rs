//! Messages exchanged between nodes: metadata, control commands, and
//! payload slices, plus the wire codec for the metadata record.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::internal::node::{Node, EMPTY};
use crate::utils::{PsError, SArray};

/// Element type tag carried per payload slice. Informational: receivers
/// dispatch by slice count and context, not by tag.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum DataType {
    Char,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Other,
}

/// Fixed-width element types that can travel as payload slices, encoded as
/// little-endian bytes.
pub trait Scalar: Copy + Send + Sync + 'static {
    /// Tag recorded in `Meta::data_type` for slices of this element.
    const DATA_TYPE: DataType;

    /// Encoded width in bytes.
    const WIDTH: usize;

    /// The all-zeroes element, used to pre-size output buffers.
    const ZERO: Self;

    fn write_le(self, buf: &mut BytesMut);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($t:ty, $tag:expr, $zero:expr) => {
        impl Scalar for $t {
            const DATA_TYPE: DataType = $tag;
            const WIDTH: usize = std::mem::size_of::<$t>();
            const ZERO: Self = $zero;

            fn write_le(self, buf: &mut BytesMut) {
                buf.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }
        }
    };
}

impl_scalar!(i8, DataType::Int8, 0);
impl_scalar!(i16, DataType::Int16, 0);
impl_scalar!(i32, DataType::Int32, 0);
impl_scalar!(i64, DataType::Int64, 0);
impl_scalar!(u8, DataType::UInt8, 0);
impl_scalar!(u16, DataType::UInt16, 0);
impl_scalar!(u32, DataType::UInt32, 0);
impl_scalar!(u64, DataType::UInt64, 0);
impl_scalar!(f32, DataType::Float, 0.0);
impl_scalar!(f64, DataType::Double, 0.0);

/// Encodes a typed array into its little-endian wire bytes.
pub(crate) fn sarray_to_bytes<T: Scalar>(arr: &SArray<T>) -> Bytes {
    let mut buf = BytesMut::with_capacity(arr.len() * T::WIDTH);
    for &v in arr.as_slice() {
        v.write_le(&mut buf);
    }
    buf.freeze()
}

/// Decodes a payload slice back into a typed array. The element count must
/// divide evenly.
pub(crate) fn sarray_from_bytes<T: Scalar>(
    bytes: &Bytes,
) -> Result<SArray<T>, PsError> {
    if bytes.len() % T::WIDTH != 0 {
        return logged_err!(
            "payload of {}B is not a multiple of element width {}",
            bytes.len(),
            T::WIDTH
        );
    }
    let mut out = Vec::with_capacity(bytes.len() / T::WIDTH);
    for chunk in bytes.chunks_exact(T::WIDTH) {
        out.push(T::read_le(chunk));
    }
    Ok(SArray::from_vec(out))
}

/// System control command. `Empty` marks a data message; everything else is
/// consumed by the transport core itself.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Default, Serialize, Deserialize,
)]
pub enum Command {
    #[default]
    Empty,
    AddNode,
    Ack,
    Barrier,
    Heartbeat,
    Terminate,
}

/// Control portion of a message's metadata.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Control {
    /// Command; `Empty` for data messages.
    pub cmd: Command,

    /// Nodes this command concerns (membership traffic).
    pub nodes: Vec<Node>,

    /// For barrier commands, the group being synchronized.
    pub barrier_group: i32,
}

impl Control {
    pub fn is_empty(&self) -> bool {
        self.cmd == Command::Empty
    }

    pub fn is_ack(&self) -> bool {
        self.cmd == Command::Ack
    }
}

/// Metadata of one message. `sender` and `receiver` are not serialized: the
/// identity frame carries the sender on the wire, and the receiver is
/// whoever read the message off its socket.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Meta {
    /// User-defined command head for app-level messages.
    pub head: i32,

    /// App this message belongs to.
    pub app_id: i32,

    /// Customer within the app.
    pub customer_id: i32,

    /// Sending node's id; filled from the transport identity on receive.
    #[serde(skip)]
    pub sender: i32,

    /// Receiving node's id; filled by the receiving node.
    #[serde(skip)]
    pub receiver: i32,

    /// True for requests; false for replies. For barriers, a request enters
    /// the barrier and a reply releases it.
    pub request: bool,

    /// Message pushes data.
    pub push: bool,

    /// Message pulls data.
    pub pull: bool,

    /// Message belongs to a SimpleApp.
    pub simple_app: bool,

    /// Control portion; `Empty` cmd means a data message.
    pub control: Control,

    /// Sender-local monotonic counter, doubling as the request id.
    pub timestamp: i32,

    /// Signature of the message being acknowledged; only meaningful on ACK.
    pub msg_sign: u64,

    /// Delivery priority; higher is dispatched first.
    pub priority: i32,

    /// Total payload bytes across all slices.
    pub data_size: u64,

    /// Optional opaque body.
    pub body: String,

    /// One element-type tag per payload slice.
    pub data_type: Vec<DataType>,
}

impl Default for Meta {
    fn default() -> Self {
        Meta {
            head: EMPTY,
            app_id: EMPTY,
            customer_id: EMPTY,
            sender: EMPTY,
            receiver: EMPTY,
            request: false,
            push: false,
            pull: false,
            simple_app: false,
            control: Control::default(),
            timestamp: EMPTY,
            msg_sign: 0,
            priority: 0,
            data_size: 0,
            body: String::new(),
            data_type: Vec::new(),
        }
    }
}

/// A message travelling between nodes: metadata plus payload slices. Data
/// messages carry 2 or 3 slices (keys, values, optional per-key lengths).
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Message {
    pub meta: Meta,
    pub data: Vec<Bytes>,
}

impl Message {
    /// Appends a typed array as the next payload slice, updating the
    /// data-type tags and total payload size.
    pub fn add_data<T: Scalar>(&mut self, arr: &SArray<T>) {
        debug_assert_eq!(self.data.len(), self.meta.data_type.len());
        self.meta.data_type.push(T::DATA_TYPE);
        let bytes = sarray_to_bytes(arr);
        self.meta.data_size += bytes.len() as u64;
        self.data.push(bytes);
    }

    /// Keys slice of a KV message.
    pub fn keys(&self) -> &Bytes {
        assert!(self.data.len() >= 2, "KV message carries < 2 slices");
        &self.data[0]
    }

    /// Values slice of a KV message.
    pub fn values(&self) -> &Bytes {
        assert!(self.data.len() >= 2, "KV message carries < 2 slices");
        &self.data[1]
    }

    /// Per-key lengths slice of a KV message.
    pub fn lens(&self) -> &Bytes {
        assert_eq!(self.data.len(), 3, "KV message carries no lens slice");
        &self.data[2]
    }
}

/// Serializes the metadata record for the wire.
pub(crate) fn pack_meta(meta: &Meta) -> Result<Vec<u8>, PsError> {
    Ok(bincode::serde::encode_to_vec(
        meta,
        bincode::config::standard(),
    )?)
}

/// Deserializes a metadata record received from the wire.
pub(crate) fn unpack_meta(buf: &[u8]) -> Result<Meta, PsError> {
    let (meta, read) = bincode::serde::decode_from_slice::<Meta, _>(
        buf,
        bincode::config::standard(),
    )?;
    if read != buf.len() {
        return logged_err!(
            "trailing garbage after meta record: {} of {}B read",
            read,
            buf.len()
        );
    }
    Ok(meta)
}
