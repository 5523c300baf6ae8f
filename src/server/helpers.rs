use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::server::error::{LockboxError, Result};

/// Largest frame payload accepted from or sent to a client.
pub const MAX_MESSAGE_BYTES: u32 = 4 * 1024 * 1024;

/// Read one length-prefixed frame and return its payload as a String
///
/// # Errors
///
/// * `ClientDisconnected` if the peer closed the stream
/// * `MessageTooLarge` if the announced length exceeds `max_len`
/// * `InvalidCommand` for empty frames
pub async fn read_message<S>(stream: &mut S, max_len: u32) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    if let Err(err) = stream.read_exact(&mut len_bytes).await {
        return Err(disconnected_or(err));
    }

    let len = u32::from_be_bytes(len_bytes);
    if len == 0 {
        return Err(LockboxError::InvalidCommand("empty frame".into()));
    }
    if len > max_len {
        return Err(LockboxError::MessageTooLarge(len as usize));
    }

    let mut buffer = vec![0u8; len as usize];
    if let Err(err) = stream.read_exact(&mut buffer).await {
        return Err(disconnected_or(err));
    }

    Ok(String::from_utf8(buffer)?)
}

/// Write `message` as one length-prefixed frame
pub async fn write_message<S>(stream: &mut S, message: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let payload = message.as_bytes();
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_BYTES)
        .ok_or(LockboxError::MessageTooLarge(payload.len()))?;

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

fn disconnected_or(err: std::io::Error) -> LockboxError {
    match err.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            LockboxError::ClientDisconnected
        }
        _ => LockboxError::Io(err),
    }
}
