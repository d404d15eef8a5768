// src/core/proxy/collapse.rs

//! A single-writer, many-reader broadcaster for one origin response body.
//!
//! The writer appends chunks into a pre-sized buffer; readers can attach at
//! any point and always receive the body from the first byte, waiting when
//! they catch up with the writer until it closes the stream.

use crate::core::errors::StrideError;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::ops::Range;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Size of the blocks handed to attached client writers.
pub const HTTP_BLOCK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    chunks: usize,
    closed: bool,
    aborted: bool,
}

#[derive(Debug, Default)]
struct Buffer {
    data: Vec<u8>,
    refs: Vec<Range<usize>>,
}

/// Status line and headers of the response being forwarded.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub struct ProgressiveCollapseForwarder {
    buffer: Mutex<Buffer>,
    head: Mutex<Option<ResponseHead>>,
    max_slots: usize,
    progress: watch::Sender<Progress>,
    clients: watch::Sender<usize>,
}

impl ProgressiveCollapseForwarder {
    pub fn new(content_length: usize) -> Self {
        Self {
            buffer: Mutex::new(Buffer {
                data: Vec::with_capacity(content_length),
                refs: Vec::new(),
            }),
            head: Mutex::new(None),
            max_slots: (content_length / HTTP_BLOCK_SIZE) * 2 + 1,
            progress: watch::Sender::new(Progress::default()),
            clients: watch::Sender::new(0),
        }
    }

    pub fn set_response_head(&self, status: StatusCode, headers: HeaderMap) {
        *self.head.lock() = Some(ResponseHead { status, headers });
    }

    pub fn response_head(&self) -> Option<ResponseHead> {
        self.head.lock().clone()
    }

    /// How many chunks the writer may append in total.
    pub fn slots(&self) -> usize {
        self.max_slots
    }

    /// Appends one chunk and wakes any waiting readers.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, StrideError> {
        {
            let mut buffer = self.buffer.lock();
            if self.progress.borrow().closed {
                return Err(StrideError::Internal("write after close".to_string()));
            }
            if buffer.refs.len() >= self.max_slots {
                return Err(StrideError::WriteSlotsExhausted);
            }
            let start = buffer.data.len();
            buffer.data.extend_from_slice(bytes);
            let end = buffer.data.len();
            buffer.refs.push(start..end);
        }
        self.progress.send_modify(|p| p.chunks += 1);
        Ok(bytes.len())
    }

    /// Signals the end of the stream.
    pub fn close(&self) {
        self.progress.send_modify(|p| p.closed = true);
    }

    /// Ends the stream as failed. Readers get `OriginAborted` instead of the
    /// rest of the body.
    pub fn abort(&self) {
        self.progress.send_modify(|p| {
            p.closed = true;
            p.aborted = true;
        });
    }

    /// Copies chunk `index` into `buf`, waiting for the writer if necessary.
    pub async fn index_read(&self, index: usize, buf: &mut Vec<u8>) -> Result<usize, StrideError> {
        let snapshot = *self.progress.borrow();
        if snapshot.aborted {
            return Err(StrideError::OriginAborted);
        }
        if snapshot.closed && index >= snapshot.chunks {
            return Err(StrideError::EndOfStream);
        }
        if index >= self.max_slots {
            return Err(StrideError::ReadIndexTooLarge);
        }

        let mut rx = self.progress.subscribe();
        let progress = *rx
            .wait_for(|p| p.chunks > index || p.closed)
            .await
            .map_err(|_| StrideError::EndOfStream)?;
        if progress.aborted {
            return Err(StrideError::OriginAborted);
        }
        if progress.chunks <= index {
            return Err(StrideError::EndOfStream);
        }

        let buffer = self.buffer.lock();
        let range = buffer.refs[index].clone();
        buf.clear();
        buf.extend_from_slice(&buffer.data[range]);
        Ok(buf.len())
    }

    /// Streams the whole body into `writer` in `HTTP_BLOCK_SIZE` writes,
    /// returning once the writer side has closed and everything was delivered.
    pub async fn add_client<W>(&self, writer: &mut W) -> Result<(), StrideError>
    where
        W: AsyncWrite + Unpin,
    {
        self.clients.send_modify(|c| *c += 1);
        let result = self.stream_to(writer).await;
        self.clients.send_modify(|c| *c -= 1);
        result
    }

    async fn stream_to<W>(&self, writer: &mut W) -> Result<(), StrideError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(HTTP_BLOCK_SIZE);
        let mut index = 0;
        loop {
            match self.index_read(index, &mut buf).await {
                Ok(_) => {
                    for block in buf.chunks(HTTP_BLOCK_SIZE) {
                        writer.write_all(block).await?;
                    }
                    index += 1;
                }
                Err(StrideError::EndOfStream) => break,
                // Every slot was delivered; the writer cannot add more.
                Err(StrideError::ReadIndexTooLarge) if index == self.max_slots => {
                    self.wait_server_complete().await;
                    if self.progress.borrow().aborted {
                        return Err(StrideError::OriginAborted);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        writer.flush().await?;
        Ok(())
    }

    pub async fn wait_server_complete(&self) {
        let mut rx = self.progress.subscribe();
        let _ = rx.wait_for(|p| p.closed).await;
    }

    pub async fn wait_all_complete(&self) {
        let mut rx = self.clients.subscribe();
        let _ = rx.wait_for(|c| *c == 0).await;
    }

    /// The complete body. Fails until the writer has closed.
    pub fn body(&self) -> Result<Bytes, StrideError> {
        let progress = *self.progress.borrow();
        if progress.aborted {
            return Err(StrideError::OriginAborted);
        }
        if !progress.closed {
            return Err(StrideError::ServerRequestIncomplete);
        }
        Ok(Bytes::copy_from_slice(&self.buffer.lock().data))
    }
}
