use byteorder::{ByteOrder, NativeEndian};

use super::checksum::xor_checksum;
use super::constants::*;
use super::error::BuildError;
use super::raw_copper::RawCopper;

pub const SENDHDR_NBYTES: usize = SENDHDR_NWORDS * WORD_SIZE;
pub const SENDTRL_NBYTES: usize = SENDTRL_NWORDS * WORD_SIZE;

/// The outer header prepended to every packet sent downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendHeader {
    words: [u32; SENDHDR_NWORDS],
}

impl Default for SendHeader {
    fn default() -> Self {
        let mut words = [0; SENDHDR_NWORDS];
        words[SENDHDR_POS_HDR_NWORDS] = SENDHDR_NWORDS as u32;
        Self { words }
    }
}

impl SendHeader {
    /// Decode a header read off the wire (host endianness)
    pub fn from_bytes(bytes: &[u8; SENDHDR_NBYTES]) -> Self {
        let mut words = [0; SENDHDR_NWORDS];
        NativeEndian::read_u32_into(bytes, &mut words);
        Self { words }
    }

    pub fn words(&self) -> &[u32; SENDHDR_NWORDS] {
        &self.words
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words[..])
    }

    pub fn total_words(&self) -> u32 {
        self.words[SENDHDR_POS_NWORDS]
    }

    pub fn set_total_words(&mut self, nwords: u32) {
        self.words[SENDHDR_POS_NWORDS] = nwords;
    }

    pub fn hdr_nwords(&self) -> u32 {
        self.words[SENDHDR_POS_HDR_NWORDS]
    }

    /// Body size implied by the total. Negative when the header is corrupt.
    pub fn body_words(&self) -> i64 {
        self.total_words() as i64 - SENDHDR_NWORDS as i64 - SENDTRL_NWORDS as i64
    }

    pub fn num_events(&self) -> u32 {
        self.words[SENDHDR_POS_NUM_EVE_NUM_NODES] >> 16
    }

    pub fn num_nodes(&self) -> u32 {
        self.words[SENDHDR_POS_NUM_EVE_NUM_NODES] & 0xFFFF
    }

    pub fn set_num_events_nodes(&mut self, num_events: u32, num_nodes: u32) {
        self.words[SENDHDR_POS_NUM_EVE_NUM_NODES] = (num_events << 16) | (num_nodes & 0xFFFF);
    }

    pub fn exp_run_subrun(&self) -> u32 {
        self.words[SENDHDR_POS_EXP_RUN_NUMBER]
    }

    pub fn set_exp_run_subrun(&mut self, word: u32) {
        self.words[SENDHDR_POS_EXP_RUN_NUMBER] = word;
    }

    pub fn eve_no(&self) -> u32 {
        self.words[SENDHDR_POS_EVE_NO]
    }

    pub fn set_eve_no(&mut self, eve_no: u32) {
        self.words[SENDHDR_POS_EVE_NO] = eve_no;
    }

    pub fn node_id(&self) -> u32 {
        self.words[SENDHDR_POS_NODE_ID]
    }

    pub fn set_node_id(&mut self, node_id: u32) {
        self.words[SENDHDR_POS_NODE_ID] = node_id;
    }
}

/// The outer trailer appended to every packet sent downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTrailer {
    words: [u32; SENDTRL_NWORDS],
}

impl Default for SendTrailer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SendTrailer {
    pub fn new(checksum: u32) -> Self {
        let mut words = [0; SENDTRL_NWORDS];
        words[SENDTRL_POS_CHKSUM] = checksum;
        words[SENDTRL_POS_TERM_WORD] = MAGIC_WORD_SEND_TRAILER;
        Self { words }
    }

    pub fn from_bytes(bytes: &[u8; SENDTRL_NBYTES]) -> Self {
        let mut words = [0; SENDTRL_NWORDS];
        NativeEndian::read_u32_into(bytes, &mut words);
        Self { words }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words[..])
    }

    pub fn checksum(&self) -> u32 {
        self.words[SENDTRL_POS_CHKSUM]
    }

    pub fn term_word(&self) -> u32 {
        self.words[SENDTRL_POS_TERM_WORD]
    }

    pub fn is_term_valid(&self) -> bool {
        self.term_word() == MAGIC_WORD_SEND_TRAILER
    }
}

/// A packet ready for the wire: header and trailer by value, body borrowed from the record buffer
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub header: SendHeader,
    pub body: &'a [u32],
    pub trailer: SendTrailer,
}

impl<'a> Frame<'a> {
    pub fn total_words(&self) -> usize {
        SENDHDR_NWORDS + self.body.len() + SENDTRL_NWORDS
    }

    pub fn total_bytes(&self) -> usize {
        self.total_words() * WORD_SIZE
    }

    pub fn body_bytes(&self) -> &'a [u8] {
        bytemuck::cast_slice(self.body)
    }

    /// The three byte segments in wire order
    pub fn segments(&self) -> [&[u8]; 3] {
        [
            self.header.as_bytes(),
            self.body_bytes(),
            self.trailer.as_bytes(),
        ]
    }

    /// Copy the whole packet into one contiguous byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.total_bytes());
        for segment in self.segments() {
            bytes.extend_from_slice(segment);
        }
        bytes
    }
}

/// Wraps a record of blocks in the outer send header and trailer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameBuilder;

impl FrameBuilder {
    pub fn wrap<'a>(view: &RawCopper<'a>) -> Result<Frame<'a>, BuildError> {
        let body = view.whole_buffer();
        let total_words = SENDHDR_NWORDS + body.len() + SENDTRL_NWORDS;

        if view.num_events() > 0xFFFF || view.num_nodes() > 0xFFFF {
            return Err(BuildError::TooManyEntries {
                events: view.num_events(),
                nodes: view.num_nodes(),
            });
        }

        let mut header = SendHeader::default();
        header.set_total_words(total_words as u32);
        header.set_num_events_nodes(view.num_events() as u32, view.num_nodes() as u32);

        // Event identity comes from the first block that is not an FTSW or TLU
        let mut source = None;
        for n in 0..view.entry_count() {
            if view.is_copper(n)? {
                source = Some(n);
                break;
            }
        }
        let source = source.ok_or(BuildError::NoCopperBlock {
            entries: view.entry_count(),
            words: body.len(),
        })?;
        let raw_header = view.header(source)?;
        header.set_exp_run_subrun(raw_header.exp_run_subrun());
        header.set_eve_no(raw_header.eve_no());
        header.set_node_id(raw_header.node_id());

        if view.entry_count() == 1 {
            let embedded = view.block_words(0)?;
            if total_words != embedded + SENDHDR_NWORDS + SENDTRL_NWORDS {
                return Err(BuildError::LengthMismatch {
                    total: total_words,
                    embedded,
                });
            }
        }

        Ok(Frame {
            header,
            body,
            trailer: SendTrailer::new(xor_checksum(body)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{build_ftsw_block, build_tlu_block, CopperBlockBuilder};

    #[test]
    fn test_wrap_single_block() {
        let record = CopperBlockBuilder::new(1234, 0x0301_0007)
            .exp_run_subrun(0x0040_2301)
            .finesse(0, vec![9, 8, 7])
            .build();
        let view = RawCopper::single(&record, record.len()).unwrap();
        let frame = FrameBuilder::wrap(&view).unwrap();

        assert_eq!(frame.total_words(), record.len() + 8);
        assert_eq!(frame.header.total_words() as usize, frame.total_words());
        assert_eq!(frame.header.hdr_nwords(), 6);
        assert_eq!(frame.header.body_words(), record.len() as i64);
        assert_eq!(frame.header.num_events(), 1);
        assert_eq!(frame.header.num_nodes(), 1);
        assert_eq!(frame.header.eve_no(), 1234);
        assert_eq!(frame.header.node_id(), 0x0301_0007);
        assert_eq!(frame.header.exp_run_subrun(), 0x0040_2301);
        assert!(frame.trailer.is_term_valid());
        assert_eq!(frame.trailer.checksum(), xor_checksum(&record));
        assert_eq!(frame.to_bytes().len(), frame.total_bytes());
    }

    #[test]
    fn test_identity_skips_ftsw_and_tlu() {
        let mut record = build_ftsw_block(50, 1, 2, 3);
        record.extend(build_tlu_block(50));
        record.extend(
            CopperBlockBuilder::new(51, 0x0301_0002)
                .finesse(0, vec![1])
                .build(),
        );
        let view = RawCopper::new(&record, record.len(), 1, 3).unwrap();
        let frame = FrameBuilder::wrap(&view).unwrap();
        assert_eq!(frame.header.eve_no(), 51);
        assert_eq!(frame.header.node_id(), 0x0301_0002);
        assert_eq!(frame.header.num_nodes(), 3);
    }

    #[test]
    fn test_no_copper_block() {
        let mut record = build_ftsw_block(50, 1, 2, 3);
        record.extend(build_tlu_block(50));
        let view = RawCopper::new(&record, record.len(), 1, 2).unwrap();
        assert_eq!(
            FrameBuilder::wrap(&view).unwrap_err(),
            BuildError::NoCopperBlock {
                entries: 2,
                words: record.len()
            }
        );
    }

    #[test]
    fn test_length_mismatch() {
        let mut record = CopperBlockBuilder::new(1, 0x0301_0001)
            .finesse(0, vec![1])
            .build();
        let embedded = record.len();
        record.push(0);
        let view = RawCopper::single(&record, record.len()).unwrap();
        assert_eq!(
            FrameBuilder::wrap(&view).unwrap_err(),
            BuildError::LengthMismatch {
                total: embedded + 9,
                embedded
            }
        );
    }

    #[test]
    fn test_entry_counts_must_fit_header() {
        let record = CopperBlockBuilder::new(1, 0x0301_0001)
            .finesse(0, vec![1])
            .build();
        let view = RawCopper::new(&record, record.len(), 0x1_0000, 1).unwrap();
        assert_eq!(
            FrameBuilder::wrap(&view).unwrap_err(),
            BuildError::TooManyEntries {
                events: 0x1_0000,
                nodes: 1
            }
        );
        let view = RawCopper::new(&record, record.len(), 1, 0x1_0000).unwrap();
        assert!(matches!(
            FrameBuilder::wrap(&view),
            Err(BuildError::TooManyEntries { .. })
        ));
    }

    #[test]
    fn test_header_bytes_round_trip() {
        let mut header = SendHeader::default();
        header.set_total_words(100);
        header.set_num_events_nodes(2, 5);
        header.set_eve_no(0xABCD);
        let mut bytes = [0u8; SENDHDR_NBYTES];
        bytes.copy_from_slice(header.as_bytes());
        assert_eq!(SendHeader::from_bytes(&bytes), header);
    }
}
