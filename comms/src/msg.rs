use std::{borrow::Cow, io, net::SocketAddr};

use serde::de::DeserializeOwned;

use crate::{
    Deserialize, Serialize,
    specs::rpc::{Call, PeerSpec, Reply},
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const REQUEST: Header = 2;
const RESPONSE: Header = 3;

/// A dense `f32` tensor travelling next to a request or a response.
///
/// The data is stored in row-major order and is borrowed from the frame buffer on
/// reception.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<'a> {
    pub shape: Vec<usize>,
    pub data: &'a [f32],
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Sent by every non zero rank to the master during rendezvous.
    Join {
        rank: usize,
        name: String,
        addr: SocketAddr,
    },
    /// The master's answer to `Join` once every rank has joined.
    Roster { peers: Vec<PeerSpec> },
    /// First message on every peer to peer connection.
    Hello { rank: usize },
    Shutdown,
    Disconnect,
}

/// A remote procedure invocation.
#[derive(Debug)]
pub struct Request<'a> {
    pub id: u64,
    pub call: Call,
    pub tensor: Option<Tensor<'a>>,
}

/// The answer to the `Request` with the same `id`.
#[derive(Debug)]
pub struct Response<'a> {
    pub id: u64,
    pub reply: Reply,
    pub tensor: Option<Tensor<'a>>,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Request(Request<'a>),
    Response(Response<'a>),
    Err(Cow<'a, str>),
}

#[derive(serde::Serialize)]
struct EnvelopeRef<'e, B> {
    id: u64,
    body: &'e B,
    shape: Option<&'e [usize]>,
}

#[derive(serde::Deserialize)]
struct Envelope<B> {
    id: u64,
    body: B,
    shape: Option<Vec<usize>>,
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(invalid_data(format!(
            "The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"
        )))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(invalid_data(format!("Received an invalid kind header {kind}")))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)?;
                Ok(None)
            }
            Msg::Request(req) => {
                write_envelope(buf, REQUEST, req.id, &req.call, req.tensor.as_ref())
            }
            Msg::Response(res) => {
                write_envelope(buf, RESPONSE, res.id, &res.reply, res.tensor.as_ref())
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind, rest) = split_header(buf)?;

        match kind {
            ERR => {
                let string = std::str::from_utf8(rest).map_err(invalid_data)?;
                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            REQUEST => {
                let (envelope, tensor) = read_envelope::<Call>(rest)?;
                Ok(Self::Request(Request {
                    id: envelope.id,
                    call: envelope.body,
                    tensor,
                }))
            }
            RESPONSE => {
                let (envelope, tensor) = read_envelope::<Reply>(rest)?;
                Ok(Self::Response(Response {
                    id: envelope.id,
                    reply: envelope.body,
                    tensor,
                }))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}

/// Writes the kind header, the json envelope length and the envelope itself.
///
/// The envelope is padded with whitespace up to a multiple of 4 bytes so the tensor
/// that follows it stays aligned inside the receiver's buffer.
fn write_envelope<'a, B: serde::Serialize>(
    buf: &mut Vec<u8>,
    kind: Header,
    id: u64,
    body: &B,
    tensor: Option<&'a Tensor<'a>>,
) -> io::Result<Option<&'a [u8]>> {
    buf.extend_from_slice(&kind.to_be_bytes());

    let len_at = buf.len();
    buf.extend_from_slice(&[0; HEADER_SIZE]);
    let start = buf.len();

    let envelope = EnvelopeRef {
        id,
        body,
        shape: tensor.map(|t| t.shape.as_slice()),
    };
    serde_json::to_writer(&mut *buf, &envelope)?;

    let padding = (HEADER_SIZE - (buf.len() - start) % HEADER_SIZE) % HEADER_SIZE;
    buf.resize(buf.len() + padding, b' ');

    let len = (buf.len() - start) as Header;
    buf[len_at..start].copy_from_slice(&len.to_be_bytes());

    Ok(tensor.map(|t| bytemuck::cast_slice(t.data)))
}

fn read_envelope<B: DeserializeOwned>(
    buf: &[u8],
) -> io::Result<(Envelope<B>, Option<Tensor<'_>>)> {
    let (len, rest) = split_header(buf)?;
    let len = len as usize;

    if rest.len() < len {
        return Err(invalid_data(format!(
            "The envelope claims {len} bytes but only {} remain",
            rest.len()
        )));
    }

    let (json, data) = rest.split_at(len);
    let envelope: Envelope<B> = serde_json::from_slice(json)?;

    let tensor = match &envelope.shape {
        None if data.is_empty() => None,
        None => {
            return Err(invalid_data(format!(
                "Received {} trailing bytes without a tensor shape",
                data.len()
            )));
        }
        Some(shape) => {
            let data: &[f32] = bytemuck::try_cast_slice(data)
                .map_err(|e| invalid_data(format!("Misaligned tensor payload: {e:?}")))?;

            let expected: usize = shape.iter().product();
            if data.len() != expected {
                return Err(invalid_data(format!(
                    "The tensor of shape {shape:?} needs {expected} values, got {}",
                    data.len()
                )));
            }

            Some(Tensor {
                shape: shape.clone(),
                data,
            })
        }
    };

    Ok((envelope, tensor))
}

fn split_header(buf: &[u8]) -> io::Result<(Header, &[u8])> {
    if buf.len() < HEADER_SIZE {
        return Msg::buf_is_too_small(buf.len());
    }

    let (head, rest) = buf.split_at(HEADER_SIZE);
    let head: [u8; HEADER_SIZE] = head.try_into().map_err(invalid_data)?;
    Ok((Header::from_be_bytes(head), rest))
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}
