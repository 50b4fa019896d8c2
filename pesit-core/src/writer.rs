//! Splits outbound file data into size-bounded DTF frames, optionally
//! batching fixed-length articles into multi-article DTFMA frames.

use std::io::Read;

use tracing::{debug, warn};

use crate::error::SessionError;
use crate::fpdu::{build_data_frame, FpduType, FPDU_HEADER_LEN};
use crate::transport::TransportChannel;

/// Fallback entity size when PI 25 was zero or absent.
pub const DEFAULT_ENTITY_SIZE: usize = 4096;
/// Per-article length prefix inside a multi-article frame.
pub const ARTICLE_PREFIX_LEN: usize = 2;

/// Progress callback: `(chunk_bytes, cumulative_bytes)` after each send.
pub type ProgressFn<'a> = &'a mut dyn FnMut(usize, u64);

pub struct ChunkWriter {
    id_dst: u8,
    max_entity_size: usize,
    record_length: usize,
    multi_article: bool,
    total_sent: u64,
}

impl ChunkWriter {
    pub fn new(id_dst: u8, max_entity_size: usize) -> Self {
        ChunkWriter::with_records(id_dst, max_entity_size, 0, false)
    }

    /// Multi-article framing only applies to known record lengths.
    pub fn with_records(
        id_dst: u8,
        max_entity_size: usize,
        record_length: usize,
        multi_article: bool,
    ) -> Self {
        let max_entity_size = if max_entity_size == 0 {
            DEFAULT_ENTITY_SIZE
        } else {
            max_entity_size
        };
        debug!(
            max_entity_size,
            record_length, multi_article, "chunk writer configured"
        );
        ChunkWriter {
            id_dst,
            max_entity_size,
            record_length,
            multi_article: multi_article && record_length > 0,
            total_sent: 0,
        }
    }

    /// Payload budget of one DTF frame.
    pub fn max_data_per_frame(&self) -> usize {
        self.max_entity_size - FPDU_HEADER_LEN
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn record_length(&self) -> usize {
        self.record_length
    }

    /// Emit `data` as one DTF frame, or as consecutive bounded frames in
    /// order when it exceeds the per-frame budget.
    pub fn write_bytes(
        &mut self,
        chan: &mut dyn TransportChannel,
        data: &[u8],
    ) -> Result<(), SessionError> {
        if data.is_empty() {
            return Ok(());
        }
        let bound = self.max_data_per_frame();
        for chunk in data.chunks(bound) {
            self.send_frame(chan, chunk)?;
        }
        Ok(())
    }

    /// Greedily batch articles into multi-article frames. An article that
    /// alone exceeds the frame budget falls back to the plain DTF path;
    /// nothing is ever dropped.
    pub fn write_articles(
        &mut self,
        chan: &mut dyn TransportChannel,
        articles: &[Vec<u8>],
    ) -> Result<(), SessionError> {
        if !self.multi_article {
            for article in articles {
                self.write_bytes(chan, article)?;
            }
            return Ok(());
        }

        let budget = self.max_data_per_frame();
        let mut batch: Vec<&[u8]> = Vec::new();
        let mut batch_size = 0usize;

        for article in articles {
            let framed = ARTICLE_PREFIX_LEN + article.len();
            if batch_size + framed > budget {
                if !batch.is_empty() {
                    self.send_article_frame(chan, &batch)?;
                    batch.clear();
                    batch_size = 0;
                }
                if framed > budget {
                    warn!(
                        article_len = article.len(),
                        max_entity_size = self.max_entity_size,
                        "article exceeds entity size, sending as plain DTF"
                    );
                    self.write_bytes(chan, article)?;
                    continue;
                }
            }
            batch.push(article);
            batch_size += framed;
        }
        if !batch.is_empty() {
            self.send_article_frame(chan, &batch)?;
        }
        Ok(())
    }

    /// Drain a stream in frame-sized blocks, invoking the progress callback
    /// after each send. Returns the total bytes written.
    pub fn write_from_stream(
        &mut self,
        chan: &mut dyn TransportChannel,
        source: &mut dyn Read,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, SessionError> {
        let mut buf = vec![0u8; self.max_data_per_frame()];
        loop {
            let n = source
                .read(&mut buf)
                .map_err(crate::error::TransportError::Io)?;
            if n == 0 {
                break;
            }
            self.send_frame(chan, &buf[..n])?;
            if let Some(cb) = progress.as_deref_mut() {
                cb(n, self.total_sent);
            }
        }
        Ok(self.total_sent)
    }

    fn send_frame(
        &mut self,
        chan: &mut dyn TransportChannel,
        chunk: &[u8],
    ) -> Result<(), SessionError> {
        let frame = build_data_frame(FpduType::Dtf, self.id_dst, 0, chunk)?;
        chan.send(&frame)?;
        self.total_sent += chunk.len() as u64;
        debug!(bytes = chunk.len(), total = self.total_sent, "sent DTF");
        Ok(())
    }

    fn send_article_frame(
        &mut self,
        chan: &mut dyn TransportChannel,
        batch: &[&[u8]],
    ) -> Result<(), SessionError> {
        let mut payload = Vec::new();
        for article in batch {
            payload.extend_from_slice(&(article.len() as u16).to_be_bytes());
            payload.extend_from_slice(article);
        }
        let frame = build_data_frame(FpduType::Dtfma, self.id_dst, 0, &payload)?;
        chan.send(&frame)?;
        let data_len: usize = batch.iter().map(|a| a.len()).sum();
        self.total_sent += data_len as u64;
        debug!(
            articles = batch.len(),
            bytes = data_len,
            total = self.total_sent,
            "sent DTFMA"
        );
        Ok(())
    }
}

/// Split a multi-article payload back into its length-prefixed articles.
pub fn split_articles(payload: &[u8]) -> Vec<Vec<u8>> {
    let mut articles = Vec::new();
    let mut rest = payload;
    while rest.len() >= ARTICLE_PREFIX_LEN {
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        if rest.len() < ARTICLE_PREFIX_LEN + len {
            warn!(
                declared = len,
                remaining = rest.len(),
                "truncated article prefix, dropping tail"
            );
            break;
        }
        articles.push(rest[ARTICLE_PREFIX_LEN..ARTICLE_PREFIX_LEN + len].to_vec());
        rest = &rest[ARTICLE_PREFIX_LEN + len..];
    }
    articles
}
