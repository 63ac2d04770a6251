use super::buffer_pool::{BufferHandle, BufferPool};
use super::checksum::xor_checksum;
use super::error::{RecordError, RecvError};
use super::pause::PauseSignal;
use super::raw_copper::{EventNumberCheck, RawCopper};
use super::send_frame::{SendHeader, SendTrailer, SENDHDR_NBYTES, SENDTRL_NBYTES};
use super::transport::{NetworkTransport, WireSource};

/// One packet read from upstream. The body lives in a buffer checked out of the pool.
#[derive(Debug)]
pub struct ReceivedRecord {
    pub handle: BufferHandle,
    pub header: SendHeader,
    pub trailer: SendTrailer,
    pub body_words: usize,
    pub entries: usize,
}

impl ReceivedRecord {
    pub fn view<'a>(
        &'a self,
        pool: &'a BufferPool,
        check: EventNumberCheck,
    ) -> Result<RawCopper<'a>, RecvError> {
        let buffer = pool.buffer(&self.handle)?;
        Ok(RawCopper::new(
            buffer,
            self.body_words,
            self.header.num_events() as usize,
            self.header.num_nodes() as usize,
        )?
        .with_event_number_check(check))
    }

    pub fn total_bytes(&self) -> usize {
        SENDHDR_NBYTES + self.body_words * super::constants::WORD_SIZE + SENDTRL_NBYTES
    }
}

/// Count the blocks in a body by walking their declared lengths; they must tile it exactly
fn count_entries(body: &[u32]) -> Result<usize, RecordError> {
    let length = body.len();
    let mut pos = 0;
    let mut entries = 0;
    while pos < length {
        let declared = body[pos] as usize;
        if declared == 0 || pos + declared > length {
            return Err(RecordError::CorruptLength {
                block: entries,
                declared,
                length,
            });
        }
        pos += declared;
        entries += 1;
    }
    Ok(entries)
}

/// Reads framed packets from an upstream connection into pool buffers.
#[derive(Debug, Clone)]
pub struct Receiver {
    max_event_words: usize,
    verify_checksum: bool,
}

impl Receiver {
    pub fn new(max_event_words: usize, verify_checksum: bool) -> Self {
        Self {
            max_event_words,
            verify_checksum,
        }
    }

    /// Receive one packet: header, body, trailer.
    ///
    /// The body size declared in the header must be positive and at most `max_event_words`.
    /// The blocks of the body must tile it exactly and their count must equal events times
    /// nodes. The trailer terminator is always checked, the checksum only if enabled.
    pub fn recv_block<P: PauseSignal, R: WireSource>(
        &self,
        net: &mut NetworkTransport<P>,
        conn: &mut R,
        pool: &mut BufferPool,
    ) -> Result<ReceivedRecord, RecvError> {
        let mut header_bytes = [0u8; SENDHDR_NBYTES];
        net.recv_exact(conn, &mut header_bytes)?;
        let header = SendHeader::from_bytes(&header_bytes);

        let body = header.body_words();
        if body <= 0 || body as usize > self.max_event_words {
            return Err(RecvError::BadBodySize {
                total: header.total_words(),
                body,
                max: self.max_event_words,
            });
        }
        let body_words = body as usize;

        let mut handle = pool.acquire_sized(body_words)?;
        let buffer = pool.buffer_mut(&mut handle)?;
        let body = &mut buffer[..body_words];
        net.recv_exact(conn, bytemuck::cast_slice_mut(body))?;

        let entries = count_entries(body)?;
        let events = header.num_events() as usize;
        let nodes = header.num_nodes() as usize;
        if entries != events * nodes {
            return Err(RecvError::EntryCountMismatch {
                entries,
                events,
                nodes,
            });
        }

        let mut trailer_bytes = [0u8; SENDTRL_NBYTES];
        net.recv_exact(conn, &mut trailer_bytes)?;
        let trailer = SendTrailer::from_bytes(&trailer_bytes);
        if !trailer.is_term_valid() {
            return Err(RecvError::BadTrailer(trailer.term_word()));
        }
        if self.verify_checksum {
            let expected = xor_checksum(body);
            if expected != trailer.checksum() {
                return Err(RecvError::BadChecksum {
                    expected,
                    found: trailer.checksum(),
                });
            }
        }

        Ok(ReceivedRecord {
            handle,
            header,
            trailer,
            body_words,
            entries,
        })
    }
}
