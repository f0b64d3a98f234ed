//! Worker socket protocol.
//!
//! Decrypt port:
//!
//! ```text
//! -> [u8 len][adam_id][u8 len][key]          once per connection
//! -> [u32 LE len][sample]                    per sample
//! <- exactly len bytes of plaintext          per sample
//! ```
//!
//! M3U8 port:
//!
//! ```text
//! -> [u8 len][adam_id]
//! <- one '\n'-terminated line: a URL on success, empty on failure
//! ```

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// Longest adam_id or key the one-byte length prefix can carry.
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Longest M3U8 reply line accepted before the connection is dropped.
pub const MAX_LINE_LEN: usize = 64 * 1024;

fn push_short_field(buf: &mut Vec<u8>, name: &'static str, value: &str) -> Result<(), ProxyError> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_FIELD_LEN {
        return Err(ProxyError::FieldTooLong {
            field: name,
            len: bytes.len(),
        });
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Encodes the per-connection decrypt context.
pub fn encode_decrypt_context(adam_id: &str, key: &str) -> Result<Vec<u8>, ProxyError> {
    let mut buf = Vec::with_capacity(2 + adam_id.len() + key.len());
    push_short_field(&mut buf, "adam_id", adam_id)?;
    push_short_field(&mut buf, "key", key)?;
    Ok(buf)
}

/// Encodes an M3U8 lookup request.
pub fn encode_m3u8_request(adam_id: &str) -> Result<Vec<u8>, ProxyError> {
    let mut buf = Vec::with_capacity(1 + adam_id.len());
    push_short_field(&mut buf, "adam_id", adam_id)?;
    Ok(buf)
}

/// Writes one sample frame.
pub async fn write_sample<W>(writer: &mut W, sample: &[u8]) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(sample.len()).map_err(|_| ProxyError::SampleTooLarge(sample.len()))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(sample).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly `len` bytes of decrypted output.
pub async fn read_plaintext<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ProxyError::ShortRead {
                expected: len,
                received: filled,
            });
        }
        filled += n;
    }
    Ok(buf)
}

/// Reads the M3U8 reply line, without its terminator.
pub async fn read_reply_line<R>(reader: &mut R) -> Result<String, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let mut limited = reader.take(MAX_LINE_LEN as u64 + 1);
    limited.read_until(b'\n', &mut raw).await?;
    if raw.len() > MAX_LINE_LEN {
        return Err(ProxyError::InvalidReply(format!(
            "reply line longer than {} bytes",
            MAX_LINE_LEN
        )));
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Accepts an M3U8 reply only if it is an http(s) URL.
pub fn parse_m3u8_line(line: &str) -> Result<String, ProxyError> {
    let url = line.trim();
    if url.is_empty() {
        return Err(ProxyError::InvalidReply("empty M3U8 reply".to_string()));
    }
    if !url.starts_with("http") {
        return Err(ProxyError::InvalidReply(format!(
            "M3U8 reply is not a URL: {:.64}",
            url
        )));
    }
    Ok(url.to_string())
}
