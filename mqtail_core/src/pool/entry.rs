//! Data entries and payload chunks
//!
//! An [`Entry`] is one in-flight or completed transaction record. Its
//! payload lives in an ordered list of fixed-size [`Chunk`]s so a record
//! can grow past one buffer without reallocating. Entries and chunks are
//! allocated once by the pool and recycled for the life of the process;
//! they move by value between the global freelists, per-thread caches,
//! the SPMC queue and the owning thread, so an entry can never be on two
//! lists at once.

/// A fixed-capacity payload buffer segment.
///
/// Chunks are allocated once at pool construction and never resized.
pub struct Chunk {
    buf: Box<[u8]>,
}

impl Chunk {
    pub(crate) fn new(size: usize) -> Chunk {
        Chunk {
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Fixed capacity of this chunk in bytes
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Lifecycle state of an [`Entry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// On a freelist or in a cache, payload cleared
    Empty,
    /// Owned by the reader, fragments being appended
    Open,
    /// Terminal fragment appended; queued or owned by a worker
    Done,
}

impl EntryState {
    /// Human-readable state name for logs
    pub fn name(&self) -> &'static str {
        match self {
            EntryState::Empty => "EMPTY",
            EntryState::Open => "OPEN",
            EntryState::Done => "DONE",
        }
    }
}

/// One in-flight or completed transaction record.
///
/// Exactly one thread mutates an entry at a time: the reader while it is
/// `Open`, then whichever worker dequeues it once it is `Done`. The move
/// semantics of the surrounding lists enforce this.
pub struct Entry {
    state: EntryState,
    xid: u32,
    chunks: Vec<Chunk>,
    chunk_size: usize,
    end: usize,
    key: Box<[u8]>,
    keylen: usize,
    has_data: bool,
    incomplete: bool,
}

impl Entry {
    pub(crate) fn new(chunk_size: usize, chunks_per_record: usize, max_keylen: usize) -> Entry {
        Entry {
            state: EntryState::Empty,
            xid: 0,
            chunks: Vec::with_capacity(chunks_per_record),
            chunk_size,
            end: 0,
            key: vec![0u8; max_keylen].into_boxed_slice(),
            keylen: 0,
            has_data: false,
            incomplete: false,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> EntryState {
        self.state
    }

    /// Transaction ID this entry was opened for
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Current payload length in bytes
    pub fn len(&self) -> usize {
        self.end
    }

    /// Whether no payload has been appended yet
    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Whether at least one data fragment (as opposed to key-only
    /// operations) has been appended
    pub fn has_data(&self) -> bool {
        self.has_data
    }

    /// Shard/routing key, empty if none was set
    pub fn key(&self) -> &[u8] {
        &self.key[..self.keylen]
    }

    /// Whether the record was submitted without its terminal fragment
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    /// Mark the record as submitted without its terminal fragment
    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }

    /// Number of chunks currently attached
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total payload capacity of the attached chunks
    pub fn chunk_capacity(&self) -> usize {
        self.chunks.len() * self.chunk_size
    }

    pub(crate) fn open(&mut self, xid: u32) {
        debug_assert_eq!(self.state, EntryState::Empty);
        self.state = EntryState::Open;
        self.xid = xid;
    }

    pub(crate) fn set_done(&mut self) {
        debug_assert_eq!(self.state, EntryState::Open);
        self.state = EntryState::Done;
    }

    pub(crate) fn attach_chunk(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    pub(crate) fn set_key(&mut self, key: &[u8]) {
        debug_assert!(key.len() <= self.key.len());
        self.key[..key.len()].copy_from_slice(key);
        self.keylen = key.len();
    }

    /// Append `data` at the current write offset. The caller must have
    /// attached enough chunks beforehand; this never allocates.
    pub(crate) fn extend(&mut self, data: &[u8]) {
        debug_assert!(self.end + data.len() <= self.chunk_capacity());
        let mut src = data;
        while !src.is_empty() {
            let ci = self.end / self.chunk_size;
            let off = self.end % self.chunk_size;
            let room = self.chunk_size - off;
            let n = room.min(src.len());
            self.chunks[ci].buf[off..off + n].copy_from_slice(&src[..n]);
            self.end += n;
            src = &src[n..];
        }
        self.has_data = true;
    }

    /// Concatenate the payload into `out`, clearing it first. Used by the
    /// workers to serialize a record for the backend without holding the
    /// entry across the send.
    pub fn copy_payload_into(&self, out: &mut Vec<u8>) {
        out.clear();
        let mut remaining = self.end;
        for chunk in &self.chunks {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(self.chunk_size);
            out.extend_from_slice(&chunk.as_slice()[..n]);
            remaining -= n;
        }
    }

    /// Payload as an owned `Vec`, for tests and dump logging
    pub fn payload_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.end);
        self.copy_payload_into(&mut out);
        out
    }

    /// Clear the entry back to `Empty` and detach all chunks into
    /// `freed`. Returns the number of chunks freed. Must be called by
    /// the single thread owning the entry.
    pub(crate) fn reset(&mut self, freed: &mut Vec<Chunk>) -> usize {
        let n = self.chunks.len();
        freed.append(&mut self.chunks);
        self.state = EntryState::Empty;
        self.xid = 0;
        self.end = 0;
        self.keylen = 0;
        self.has_data = false;
        self.incomplete = false;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_chunks(chunk_size: usize, n: usize) -> Entry {
        let mut e = Entry::new(chunk_size, n, 16);
        for _ in 0..n {
            e.attach_chunk(Chunk::new(chunk_size));
        }
        e
    }

    #[test]
    fn test_extend_spans_chunk_boundary() {
        let mut e = entry_with_chunks(4, 3);
        e.extend(b"abcdef");
        e.extend(b"ghij");
        assert_eq!(e.len(), 10);
        assert_eq!(e.payload_to_vec(), b"abcdefghij");
    }

    #[test]
    fn test_copy_payload_reuses_buffer() {
        let mut e = entry_with_chunks(8, 2);
        e.extend(b"hello");
        let mut buf = Vec::with_capacity(16);
        e.copy_payload_into(&mut buf);
        assert_eq!(buf, b"hello");
        e.extend(b" world");
        e.copy_payload_into(&mut buf);
        assert_eq!(buf, b"hello world");
    }

    #[test]
    fn test_reset_detaches_chunks_and_clears() {
        let mut e = entry_with_chunks(4, 2);
        e.open(42);
        e.extend(b"12345678");
        e.set_key(b"k1");
        e.mark_incomplete();
        e.set_done();

        let mut freed = Vec::new();
        let n = e.reset(&mut freed);
        assert_eq!(n, 2);
        assert_eq!(freed.len(), 2);
        assert_eq!(e.state(), EntryState::Empty);
        assert_eq!(e.len(), 0);
        assert_eq!(e.xid(), 0);
        assert!(e.key().is_empty());
        assert!(!e.has_data());
        assert!(!e.is_incomplete());
        assert_eq!(e.chunk_count(), 0);
    }

    #[test]
    fn test_key_roundtrip() {
        let mut e = entry_with_chunks(4, 1);
        e.set_key(b"0badcafe");
        assert_eq!(e.key(), b"0badcafe");
    }
}
