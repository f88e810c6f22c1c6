// Copyright (c) 2026 Lattice Mesh contributors
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed message framing.
//!
//! Wire format: `length:u32 big-endian || payload:byte[length]`. TCP
//! gives no message boundaries, so both directions handle partial
//! reads and writes. The framing layer knows nothing about payload
//! contents and is generic over the stream, so a TLS wrapper slots in
//! underneath without changes here.

use std::io::ErrorKind;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::domain::error::MeshError;

/// Default cap on a declared payload length. Guards against a hostile
/// or corrupt peer driving unbounded allocation.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one frame: 4-byte big-endian length, then exactly that many
/// payload bytes.
pub async fn write_frame<W>(io: &mut W, payload: &[u8]) -> Result<(), MeshError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| MeshError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(payload).await?;
    io.flush().await?;
    Ok(())
}

/// Read one frame, blocking until the full header and payload arrive.
///
/// Returns `Ok(None)` on a clean close at a frame boundary. A stream
/// that ends mid-header or mid-payload is a [`MeshError::Protocol`];
/// a declared length above `max_len` is [`MeshError::FrameTooLarge`].
pub async fn read_frame<R>(io: &mut R, max_len: usize) -> Result<Option<Bytes>, MeshError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = io.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(MeshError::Protocol("stream closed mid-header".into()));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(MeshError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            MeshError::Protocol("stream closed mid-frame".into())
        } else {
            MeshError::Io(e)
        }
    })?;
    Ok(Some(Bytes::from(payload)))
}
