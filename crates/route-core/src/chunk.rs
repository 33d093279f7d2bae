//! Chunking of oversized WebSocket frames and order-independent reassembly.
//!
//! A frame whose raw payload is larger than the chunk ceiling is sent as
//! `total` `chunk` envelopes sharing one fragment id. The receiver fills one
//! slot per `idx` and emits the frame once every slot is present, whatever
//! order the bus delivered them in.

use crate::envelope::{Chunk, Envelope, Frame, FrameKind, Payload};
use crate::subject::random_id;
use std::collections::HashMap;

/// Largest raw payload sent as a single `frame` envelope.
pub const DEFAULT_CHUNK_SIZE: usize = 300_000;
/// Fragments held open per session before new ones are dropped.
pub const MAX_PENDING_FRAGMENTS: usize = 64;
/// Upper bound on `total` for a single fragment.
pub const MAX_CHUNKS_PER_FRAGMENT: usize = 4096;
/// Payload bytes held across all partial fragments of one session.
pub const MAX_PENDING_BYTES: usize = 32 * 1024 * 1024;
/// Bytes reserved for the JSON fields around a frame's data.
pub const ENVELOPE_OVERHEAD: usize = 512;
/// Longest JSON rendering of one text byte: a control character as `\u00XX`.
const MAX_TEXT_ESCAPE: usize = 6;

/// Largest encoded `frame` or `chunk` envelope carrying at most `chunk_size`
/// payload bytes. Escaped text outgrows base64, so it sets the bound.
pub fn max_envelope_len(chunk_size: usize) -> usize {
    chunk_size
        .saturating_mul(MAX_TEXT_ESCAPE)
        .max(chunk_size.div_ceil(3) * 4)
        .saturating_add(ENVELOPE_OVERHEAD)
}

/// Build the envelopes for one outbound frame: a single `frame` when the
/// payload fits in `chunk_size`, otherwise one `chunk` per slice under a
/// fresh fragment id.
pub fn outbound_envelopes(payload: &Payload, chunk_size: usize) -> Vec<Envelope> {
    let chunk_size = chunk_size.max(1);
    if payload.len() <= chunk_size {
        return vec![Envelope::Frame(Frame::new(payload))];
    }

    let parts = split_payload(payload, chunk_size);
    let id = random_id();
    let total = parts.len();
    parts
        .iter()
        .enumerate()
        .map(|(idx, part)| Envelope::Chunk(Chunk::new(&id, idx, total, part)))
        .collect()
}

/// Split a payload into slices of at most `chunk_size` bytes. Text is cut on
/// character boundaries so every slice stays valid UTF-8.
fn split_payload(payload: &Payload, chunk_size: usize) -> Vec<Payload> {
    match payload {
        Payload::Binary(bytes) => bytes
            .chunks(chunk_size)
            .map(|c| Payload::Binary(c.to_vec()))
            .collect(),
        Payload::Text(text) => {
            let mut parts = Vec::new();
            let mut start = 0;
            while start < text.len() {
                let mut end = (start + chunk_size).min(text.len());
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                if end == start {
                    // chunk_size smaller than one character
                    end = start + 1;
                    while !text.is_char_boundary(end) {
                        end += 1;
                    }
                }
                parts.push(Payload::Text(text[start..end].to_string()));
                start = end;
            }
            parts
        }
    }
}

/// Result of feeding one chunk to the [`Reassembler`].
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored (or a duplicate of a stored slot); the frame is not complete yet.
    Pending,
    /// Every slot is filled; the reassembled frame.
    Complete(Payload),
    /// The chunk violated the protocol and was discarded.
    Dropped(&'static str),
}

#[derive(Debug)]
struct Fragment {
    kind: FrameKind,
    total: usize,
    slots: Vec<Option<Payload>>,
    filled: usize,
    bytes: usize,
    seq: u64,
}

impl Fragment {
    fn concat(self) -> Payload {
        match self.kind {
            FrameKind::Bin => {
                let mut out = Vec::new();
                for part in self.slots.into_iter().flatten() {
                    if let Payload::Binary(b) = part {
                        out.extend_from_slice(&b);
                    }
                }
                Payload::Binary(out)
            }
            FrameKind::Text => {
                let mut out = String::new();
                for part in self.slots.into_iter().flatten() {
                    if let Payload::Text(s) = part {
                        out.push_str(&s);
                    }
                }
                Payload::Text(out)
            }
        }
    }
}

/// Per-session reassembly table keyed by fragment id.
///
/// Bounded two ways: a new fragment id beyond `max_pending` is dropped, and
/// once held bytes would pass `max_bytes` the oldest other fragments are
/// evicted to make room.
#[derive(Debug)]
pub struct Reassembler {
    fragments: HashMap<String, Fragment>,
    max_pending: usize,
    max_bytes: usize,
    held_bytes: usize,
    next_seq: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(MAX_PENDING_FRAGMENTS, MAX_PENDING_BYTES)
    }
}

impl Reassembler {
    pub fn new(max_pending: usize, max_bytes: usize) -> Self {
        Self {
            fragments: HashMap::new(),
            max_pending,
            max_bytes,
            held_bytes: 0,
            next_seq: 0,
        }
    }

    /// Feed one chunk.
    ///
    /// The first chunk stored for an id fixes its `kind` and `total`; later
    /// chunks that disagree are dropped without touching the stored entry.
    pub fn accept(&mut self, chunk: Chunk) -> ChunkOutcome {
        if chunk.total == 0 || chunk.total > MAX_CHUNKS_PER_FRAGMENT {
            return ChunkOutcome::Dropped("total out of range");
        }
        if chunk.idx >= chunk.total {
            return ChunkOutcome::Dropped("idx out of range");
        }
        let part = match chunk.part() {
            Ok(p) => p,
            Err(_) => return ChunkOutcome::Dropped("payload does not match kind"),
        };

        if let Some(existing) = self.fragments.get(&chunk.id) {
            if existing.kind != chunk.kind || existing.total != chunk.total {
                return ChunkOutcome::Dropped("metadata mismatch");
            }
            if existing.slots[chunk.idx].is_some() {
                return ChunkOutcome::Pending;
            }
        } else if self.fragments.len() >= self.max_pending {
            return ChunkOutcome::Dropped("too many pending fragments");
        }

        let size = part.len();
        if !self.make_room(&chunk.id, size) {
            return ChunkOutcome::Dropped("fragment exceeds byte limit");
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = self
            .fragments
            .entry(chunk.id.clone())
            .or_insert_with(|| Fragment {
                kind: chunk.kind,
                total: chunk.total,
                slots: vec![None; chunk.total],
                filled: 0,
                bytes: 0,
                seq,
            });

        entry.slots[chunk.idx] = Some(part);
        entry.filled += 1;
        entry.bytes += size;
        self.held_bytes += size;

        if entry.filled < entry.total {
            return ChunkOutcome::Pending;
        }
        match self.fragments.remove(&chunk.id) {
            Some(fragment) => {
                self.held_bytes -= fragment.bytes;
                ChunkOutcome::Complete(fragment.concat())
            }
            None => ChunkOutcome::Pending,
        }
    }

    /// Evict the oldest fragments other than `keep` until `size` more bytes
    /// fit. When nothing else is left to evict, `keep` itself is discarded
    /// and this returns false.
    fn make_room(&mut self, keep: &str, size: usize) -> bool {
        while self.held_bytes + size > self.max_bytes {
            let oldest = self
                .fragments
                .iter()
                .filter(|(id, _)| id.as_str() != keep)
                .min_by_key(|(_, f)| f.seq)
                .map(|(id, _)| id.clone());
            let victim = oldest.unwrap_or_else(|| keep.to_string());
            match self.fragments.remove(&victim) {
                Some(fragment) => self.held_bytes -= fragment.bytes,
                None => return false,
            }
            if victim == keep {
                return false;
            }
        }
        true
    }

    /// Number of fragments still waiting for slots.
    pub fn pending(&self) -> usize {
        self.fragments.len()
    }

    /// Payload bytes held by partial fragments.
    pub fn held_bytes(&self) -> usize {
        self.held_bytes
    }

    /// Discard every partial fragment.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.held_bytes = 0;
    }
}
