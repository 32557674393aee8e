//! RFC 6455 WebSocket framing.
//!
//! Single-fragment frames only (`FIN` always set): the broker and agent
//! never fragment messages. The reader handles 7/16/64-bit payload lengths
//! and optional masking; the writers pick the narrowest length encoding.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Upper bound on an advertised payload length. A peer claiming more than
/// this is treated as malformed rather than allocated for.
const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// WebSocket opcodes per RFC 6455.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Decode the low nibble of a frame header byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Read a single WebSocket frame, unmasking the payload in place if the
/// peer masked it.
pub async fn read_frame<R>(r: &mut R) -> Result<(Opcode, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    r.read_exact(&mut header).await?;

    let opcode =
        Opcode::from_u8(header[0] & 0x0F).ok_or(ProtocolError::UnknownOpcode(header[0] & 0x0F))?;
    let masked = header[1] & 0x80 != 0;
    let mut length = u64::from(header[1] & 0x7F);

    match length {
        126 => {
            let mut ext = [0u8; 2];
            r.read_exact(&mut ext).await?;
            length = u64::from(u16::from_be_bytes(ext));
        }
        127 => {
            let mut ext = [0u8; 8];
            r.read_exact(&mut ext).await?;
            length = u64::from_be_bytes(ext);
        }
        _ => {}
    }

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let mut mask_key = [0u8; 4];
    if masked {
        r.read_exact(&mut mask_key).await?;
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut payload = vec![0u8; length as usize];
    r.read_exact(&mut payload).await?;

    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask_key[i & 3];
        }
    }

    Ok((opcode, payload))
}

/// Write an unmasked frame (server to peer).
pub async fn write_server_frame<W>(
    w: &mut W,
    opcode: Opcode,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(2 + 8 + payload.len());
    frame.push(0x80 | opcode as u8);
    encode_length(&mut frame, payload.len(), false);
    frame.extend_from_slice(payload);

    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Write a masked frame (client to server).
pub async fn write_client_frame<W>(
    w: &mut W,
    opcode: Opcode,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(2 + 8 + 4 + payload.len());
    frame.push(0x80 | opcode as u8);
    encode_length(&mut frame, payload.len(), true);

    let mut mask_key = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut mask_key);
    frame.extend_from_slice(&mask_key);

    // Mask inline into the same allocation.
    let off = frame.len();
    frame.resize(off + payload.len(), 0);
    for (i, byte) in payload.iter().enumerate() {
        frame[off + i] = byte ^ mask_key[i & 3];
    }

    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Append the length field, choosing the narrowest encoding. The mask bit
/// rides on the first length byte for client frames.
fn encode_length(frame: &mut Vec<u8>, length: usize, masked: bool) {
    let mask_bit = if masked { 0x80 } else { 0x00 };
    #[allow(clippy::cast_possible_truncation)]
    match length {
        0..=125 => frame.push(length as u8 | mask_bit),
        126..=65535 => {
            frame.push(126 | mask_bit);
            frame.extend_from_slice(&(length as u16).to_be_bytes());
        }
        _ => {
            frame.push(127 | mask_bit);
            frame.extend_from_slice(&(length as u64).to_be_bytes());
        }
    }
}
