//! Line codec for FCP messages.
//!
//! Reads and writes [`Message`]s over any tokio byte stream. Only
//! `EndMessage` terminated messages are supported; probe traffic never
//! carries a data payload.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{Message, END_MESSAGE};

/// Longest line accepted from the node
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Codec for reading/writing FCP messages
#[derive(Debug, Clone, Copy, Default)]
pub struct FcpCodec;

impl FcpCodec {
    /// Read the next message.
    ///
    /// Returns `Ok(None)` on a clean end of stream between messages.
    pub async fn read_message<R>(&mut self, io: &mut R) -> io::Result<Option<Message>>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = String::new();

        let name = loop {
            line.clear();
            if read_bounded_line(io, &mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if !trimmed.is_empty() {
                break trimmed.to_string();
            }
        };

        let mut message = Message::new(name);
        loop {
            line.clear();
            if read_bounded_line(io, &mut line).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside {}", message.name),
                ));
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == END_MESSAGE {
                return Ok(Some(message));
            }
            match trimmed.split_once('=') {
                Some((key, value)) => message.fields.push((key.to_string(), value.to_string())),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed field line in {}: {trimmed:?}", message.name),
                    ))
                }
            }
        }
    }

    /// Write a message and flush it
    pub async fn write_message<W>(&mut self, io: &mut W, message: &Message) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        io.write_all(message.encode().as_bytes()).await?;
        io.flush().await
    }
}

/// `read_line` that never buffers more than one byte past the limit
async fn read_bounded_line<R>(io: &mut R, line: &mut String) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *io).take(MAX_LINE_BYTES as u64 + 1).read_line(line).await?;
    if line.len() > MAX_LINE_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "line exceeds 64 KiB"));
    }
    Ok(read)
}
