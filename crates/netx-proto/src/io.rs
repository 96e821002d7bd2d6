//! Async framing helpers over a byte stream.

use bytes::BytesMut;
use netx_core::{ERROR_IO, ERROR_PROTOCOL};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    HEADER_LEN, ParseError, ParseResult, Request, Response, VERSION1, WriteError, encode_request,
    encode_response, frame_len, parse_request, parse_response,
};

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("proto: {0}")]
    Parse(ParseError),
    #[error("proto write: {0}")]
    Write(WriteError),
}

impl ProtoError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ProtoError::Io(_) => ERROR_IO,
            ProtoError::Parse(_) | ProtoError::Write(_) => ERROR_PROTOCOL,
        }
    }
}

/// Read one full frame: header first, then exactly FEALEN bytes.
async fn read_frame<R>(r: &mut R) -> Result<BytesMut, ProtoError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header).await?;
    if header[0] != VERSION1 {
        return Err(ProtoError::Parse(ParseError::InvalidVersion(header[0])));
    }
    let total = frame_len(&header);
    let mut buf = BytesMut::zeroed(total);
    buf[..HEADER_LEN].copy_from_slice(&header);
    r.read_exact(&mut buf[HEADER_LEN..]).await?;
    Ok(buf)
}

pub async fn read_request<R>(r: &mut R) -> Result<Request, ProtoError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let buf = read_frame(r).await?;
    match parse_request(&buf) {
        ParseResult::Complete((req, _)) => Ok(req),
        ParseResult::Invalid(e) => Err(ProtoError::Parse(e)),
        ParseResult::Incomplete(_) => Err(ProtoError::Parse(ParseError::FeatureOverflow)),
    }
}

pub async fn read_response<R>(r: &mut R) -> Result<Response, ProtoError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let buf = read_frame(r).await?;
    match parse_response(&buf) {
        ParseResult::Complete((resp, _)) => Ok(resp),
        ParseResult::Invalid(e) => Err(ProtoError::Parse(e)),
        ParseResult::Incomplete(_) => Err(ProtoError::Parse(ParseError::FeatureOverflow)),
    }
}

pub async fn write_request<W>(w: &mut W, req: &Request) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    encode_request(&mut buf, req).map_err(ProtoError::Write)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn write_response<W>(w: &mut W, resp: &Response) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    encode_response(&mut buf, resp).map_err(ProtoError::Write)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}
