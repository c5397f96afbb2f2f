//! `Content-Length` framing for the analyzer's stdio channel.
//!
//! Every message is a JSON value preceded by a header block:
//! `Content-Length: N\r\n\r\n{json}`. [`FrameReader`] decodes one message per
//! call, [`FrameWriter`] encodes and flushes one.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single message body. Analyzer replies carry whole
/// completion lists, so this is larger than a typical editor protocol cap.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

pub struct FrameReader<R> {
    inner: BufReader<R>,
    header_line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            header_line: String::new(),
        }
    }

    /// Decode the next message. `Ok(None)` means the peer closed the stream
    /// between messages; EOF anywhere else is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Value>> {
        let Some(len) = self.read_header_block().await? else {
            return Ok(None);
        };
        if len > MAX_FRAME_BYTES {
            bail!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
        }

        let mut body = vec![0u8; len];
        self.inner
            .read_exact(&mut body)
            .await
            .with_context(|| format!("reading {len} byte frame body"))?;
        let message = serde_json::from_slice(&body).context("decoding frame body as JSON")?;
        Ok(Some(message))
    }

    async fn read_header_block(&mut self) -> Result<Option<usize>> {
        let mut len = None;
        let mut first = true;
        loop {
            self.header_line.clear();
            let read = self
                .inner
                .read_line(&mut self.header_line)
                .await
                .context("reading frame header")?;
            if read == 0 {
                if first {
                    return Ok(None);
                }
                bail!("stream ended inside a frame header");
            }
            first = false;

            let line = self.header_line.trim();
            if line.is_empty() {
                break;
            }
            if let Some(value) = header_value(line, CONTENT_LENGTH) {
                let parsed = value
                    .parse::<usize>()
                    .with_context(|| format!("bad {CONTENT_LENGTH} `{value}`"))?;
                len = Some(parsed);
            }
        }
        len.map(Some)
            .with_context(|| format!("frame header has no {CONTENT_LENGTH}"))
    }
}

/// Value of header `name` (matched case-insensitively) in `line`.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    key.trim()
        .eq_ignore_ascii_case(name)
        .then(|| value.trim())
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn write_frame(&mut self, message: &Value) -> Result<()> {
        let frame = encode_frame(message)?;
        self.inner
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.inner.flush().await.context("flushing frame")
    }
}

/// Header and body as one buffer, so a frame is written with a single call.
fn encode_frame(message: &Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message).context("encoding frame body")?;
    let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}
