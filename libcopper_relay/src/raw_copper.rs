use serde::{Deserialize, Serialize};

use super::constants::*;
use super::error::RecordError;

/// What to do when the FINESSE sub-blocks of one COPPER block disagree on the event number.
///
/// `WarnOnly` tolerates the disagreement (useful with known-bad front-end hardware) and
/// reports the number found in the first populated slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventNumberCheck {
    #[default]
    Strict,
    WarnOnly,
}

/// Fixed-offset view of the raw header at the start of every block
#[derive(Debug, Clone, Copy)]
pub struct RawHeader<'a> {
    words: &'a [u32],
}

impl<'a> RawHeader<'a> {
    pub fn nwords(&self) -> u32 {
        self.words[RAWHEADER_POS_NWORDS]
    }

    pub fn hdr_nwords(&self) -> u32 {
        self.words[RAWHEADER_POS_VERSION_HDRNWORDS] & 0xFF
    }

    pub fn format_version(&self) -> u32 {
        (self.words[RAWHEADER_POS_VERSION_HDRNWORDS] >> 8) & 0xFF
    }

    pub fn exp_run_subrun(&self) -> u32 {
        self.words[RAWHEADER_POS_EXP_RUN_NO]
    }

    pub fn exp_no(&self) -> u32 {
        (self.exp_run_subrun() >> 22) & 0x3FF
    }

    pub fn run_no(&self) -> u32 {
        (self.exp_run_subrun() >> 8) & 0x3FFF
    }

    pub fn subrun_no(&self) -> u32 {
        self.exp_run_subrun() & 0xFF
    }

    pub fn eve_no(&self) -> u32 {
        self.words[RAWHEADER_POS_EVE_NO]
    }

    pub fn ttctime_trgtype(&self) -> u32 {
        self.words[RAWHEADER_POS_TTCTIME_TRGTYPE]
    }

    pub fn ttutime(&self) -> u32 {
        self.words[RAWHEADER_POS_TTUTIME]
    }

    pub fn node_id(&self) -> u32 {
        self.words[RAWHEADER_POS_NODE_ID]
    }

    pub fn trunc_mask(&self) -> u32 {
        self.words[RAWHEADER_POS_TRUNC_MASK]
    }
}

/// Fixed-offset view of the raw trailer at the end of every block
#[derive(Debug, Clone, Copy)]
pub struct RawTrailer<'a> {
    words: &'a [u32],
}

impl<'a> RawTrailer<'a> {
    pub fn checksum(&self) -> u32 {
        self.words[RAWTRAILER_POS_CHKSUM]
    }

    pub fn term_word(&self) -> u32 {
        self.words[RAWTRAILER_POS_TERM_WORD]
    }

    pub fn is_term_valid(&self) -> bool {
        self.term_word() == MAGIC_WORD_RAW_TRAILER
    }
}

/// RawCopper is a non-owning, bounds-checked view over a buffer of blocks.
///
/// The buffer holds `num_events * num_nodes` blocks laid end to end. Each block begins with
/// a raw header whose first word is the declared length of the block, so the n-th block is
/// found by walking the lengths of the n-1 blocks before it. COPPER blocks additionally carry
/// the driver/FPGA framing and up to four FINESSE sub-blocks; FTSW and TLU blocks only carry
/// the raw header and trailer.
///
/// Every accessor checks its offset against the record length and returns
/// [`RecordError::OutOfRange`] rather than reading past the end.
#[derive(Debug, Clone, Copy)]
pub struct RawCopper<'a> {
    buffer: &'a [u32],
    num_events: usize,
    num_nodes: usize,
    event_number_check: EventNumberCheck,
}

impl<'a> RawCopper<'a> {
    /// Create a view over the first `length` words of `buffer`
    pub fn new(
        buffer: &'a [u32],
        length: usize,
        num_events: usize,
        num_nodes: usize,
    ) -> Result<Self, RecordError> {
        if length > buffer.len() {
            return Err(RecordError::LengthExceedsBuffer(length, buffer.len()));
        }
        Ok(Self {
            buffer: &buffer[..length],
            num_events,
            num_nodes,
            event_number_check: EventNumberCheck::Strict,
        })
    }

    /// View holding a single block (one event from one node)
    pub fn single(buffer: &'a [u32], length: usize) -> Result<Self, RecordError> {
        Self::new(buffer, length, 1, 1)
    }

    pub fn with_event_number_check(mut self, check: EventNumberCheck) -> Self {
        self.event_number_check = check;
        self
    }

    pub fn total_buf_words(&self) -> usize {
        self.buffer.len()
    }

    pub fn whole_buffer(&self) -> &'a [u32] {
        self.buffer
    }

    pub fn num_events(&self) -> usize {
        self.num_events
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn entry_count(&self) -> usize {
        self.num_events * self.num_nodes
    }

    fn word(&self, offset: usize) -> Result<u32, RecordError> {
        self.buffer
            .get(offset)
            .copied()
            .ok_or(RecordError::OutOfRange {
                offset,
                length: self.buffer.len(),
            })
    }

    fn range(&self, start: usize, nwords: usize) -> Result<&'a [u32], RecordError> {
        let end = start.checked_add(nwords).ok_or(RecordError::OutOfRange {
            offset: start,
            length: self.buffer.len(),
        })?;
        self.buffer.get(start..end).ok_or(RecordError::OutOfRange {
            offset: end.saturating_sub(1),
            length: self.buffer.len(),
        })
    }

    /// Locate the start of the n-th block.
    ///
    /// Walks from the beginning of the record on every call; n is small and the view
    /// stays stateless.
    pub fn block_offset(&self, n: usize) -> Result<usize, RecordError> {
        if n >= self.entry_count() {
            return Err(RecordError::BadBlockIndex(n, self.entry_count()));
        }
        let length = self.buffer.len();
        let mut pos = 0;
        for block in 0..n {
            let declared = self.word(pos)? as usize;
            if declared == 0 || pos + declared > length {
                return Err(RecordError::CorruptLength {
                    block,
                    declared,
                    length,
                });
            }
            pos += declared;
        }
        if pos >= length {
            return Err(RecordError::OutOfRange {
                offset: pos,
                length,
            });
        }
        Ok(pos)
    }

    /// Declared length of the n-th block, validated against the end of the record
    pub fn block_words(&self, n: usize) -> Result<usize, RecordError> {
        let pos = self.block_offset(n)?;
        let declared = self.word(pos)? as usize;
        if declared < RAWHEADER_NWORDS + RAWTRAILER_NWORDS || pos + declared > self.buffer.len()
        {
            return Err(RecordError::CorruptLength {
                block: n,
                declared,
                length: self.buffer.len(),
            });
        }
        Ok(declared)
    }

    pub fn block(&self, n: usize) -> Result<&'a [u32], RecordError> {
        let pos = self.block_offset(n)?;
        let nwords = self.block_words(n)?;
        self.range(pos, nwords)
    }

    /// Walk every block and require the declared lengths to cover the record exactly
    pub fn check_block_walk(&self) -> Result<(), RecordError> {
        let length = self.buffer.len();
        let mut pos = 0;
        for block in 0..self.entry_count() {
            let declared = self.word(pos)? as usize;
            if declared == 0 || pos + declared > length {
                return Err(RecordError::CorruptLength {
                    block,
                    declared,
                    length,
                });
            }
            pos += declared;
        }
        if pos != length {
            return Err(RecordError::WalkMismatch {
                walked: pos,
                length,
            });
        }
        Ok(())
    }

    pub fn header(&self, n: usize) -> Result<RawHeader<'a>, RecordError> {
        let pos = self.block_offset(n)?;
        Ok(RawHeader {
            words: self.range(pos, RAWHEADER_NWORDS)?,
        })
    }

    pub fn trailer(&self, n: usize) -> Result<RawTrailer<'a>, RecordError> {
        let pos = self.block_offset(n)?;
        let nwords = self.block_words(n)?;
        Ok(RawTrailer {
            words: self.range(pos + nwords - RAWTRAILER_NWORDS, RAWTRAILER_NWORDS)?,
        })
    }

    pub fn is_ftsw(&self, n: usize) -> Result<bool, RecordError> {
        Ok(self.header(n)?.node_id() & SOURCE_ID_MASK == FTSW_ID)
    }

    pub fn is_tlu(&self, n: usize) -> Result<bool, RecordError> {
        Ok(self.header(n)?.node_id() & SOURCE_ID_MASK == TLU_ID)
    }

    /// A block is a COPPER block when it comes from neither an FTSW nor a TLU
    pub fn is_copper(&self, n: usize) -> Result<bool, RecordError> {
        Ok(!self.is_ftsw(n)? && !self.is_tlu(n)?)
    }

    // COPPER section words, relative to the end of the raw header

    fn copper_word(&self, n: usize, pos: usize) -> Result<u32, RecordError> {
        self.word(self.block_offset(n)? + RAWHEADER_NWORDS + pos)
    }

    /// Word `back` positions before the raw trailer of block n
    fn tail_word(&self, n: usize, back: usize) -> Result<u32, RecordError> {
        let pos = self.block_offset(n)?;
        let nwords = self.block_words(n)?;
        let min_words = RAWHEADER_NWORDS + SIZE_COPPER_HEADER + SIZE_COPPER_TRAILER + RAWTRAILER_NWORDS;
        if nwords < min_words {
            return Err(RecordError::OutOfRange {
                offset: pos + min_words - 1,
                length: pos + nwords,
            });
        }
        self.word(pos + nwords - RAWTRAILER_NWORDS - back)
    }

    pub fn copper_counter(&self, n: usize) -> Result<u32, RecordError> {
        self.copper_word(n, POS_EVE_NUM_COPPER)
    }

    pub fn subsystem_prefix(&self, n: usize) -> Result<u32, RecordError> {
        self.copper_word(n, POS_SUBSYSTEM_PREFIX)
    }

    pub fn copper_id(&self, n: usize) -> Result<u32, RecordError> {
        self.copper_word(n, POS_COPPER_ID)
    }

    pub fn data_length(&self, n: usize) -> Result<u32, RecordError> {
        self.copper_word(n, POS_DATA_LENGTH)
    }

    /// Compare the declared block length with the one implied by the COPPER data length field
    pub fn check_copper_length(&self, n: usize) -> Result<(), RecordError> {
        let declared = self.block_words(n)?;
        let computed = self.data_length(n)? as usize + COPPER_LENGTH_OVERHEAD;
        if declared != computed {
            return Err(RecordError::LengthMismatch {
                block: n,
                declared,
                computed,
            });
        }
        Ok(())
    }

    /// The four magic words in order: driver header, FPGA header, FPGA trailer, driver trailer
    pub fn magic_words(&self, n: usize) -> Result<[u32; 4], RecordError> {
        Ok([
            self.copper_word(n, POS_MAGIC_COPPER_1)?,
            self.copper_word(n, POS_MAGIC_COPPER_2)?,
            self.tail_word(n, NEG_POS_MAGIC_COPPER_3)?,
            self.tail_word(n, NEG_POS_MAGIC_COPPER_4)?,
        ])
    }

    /// Check the four magic words. A block that cannot be located is never valid.
    pub fn magic_words_valid(&self, n: usize) -> bool {
        match self.magic_words(n) {
            Ok(words) => {
                words
                    == [
                        COPPER_MAGIC_DRIVER_HEADER,
                        COPPER_MAGIC_FPGA_HEADER,
                        COPPER_MAGIC_FPGA_TRAILER,
                        COPPER_MAGIC_DRIVER_TRAILER,
                    ]
            }
            Err(_) => false,
        }
    }

    /// Checksum word written by the COPPER driver into its trailer
    pub fn recorded_driver_checksum(&self, n: usize) -> Result<u32, RecordError> {
        self.tail_word(n, NEG_POS_CHKSUM_COPPER)
    }

    /// Words covered by the driver checksum: the COPPER section up to the driver trailer
    pub fn driver_checksum_region(&self, n: usize) -> Result<&'a [u32], RecordError> {
        let pos = self.block_offset(n)?;
        let nwords = self.block_words(n)?;
        let covered = nwords
            .checked_sub(RAWHEADER_NWORDS + SIZE_COPPER_DRIVER_TRAILER + RAWTRAILER_NWORDS)
            .ok_or(RecordError::OutOfRange {
                offset: pos + nwords,
                length: self.buffer.len(),
            })?;
        self.range(pos + RAWHEADER_NWORDS, covered)
    }

    fn check_slot(slot: usize) -> Result<(), RecordError> {
        if slot >= MAX_FINESSE_SLOTS {
            Err(RecordError::BadFinesseSlot(slot))
        } else {
            Ok(())
        }
    }

    /// Number of words in FINESSE slot `slot` (0 = A ... 3 = D) of block n; 0 if unpopulated
    pub fn finesse_words(&self, n: usize, slot: usize) -> Result<usize, RecordError> {
        Self::check_slot(slot)?;
        Ok(self.copper_word(n, POS_CH_A_DATA_LENGTH + slot)? as usize)
    }

    /// Offset (from the start of the record) of FINESSE slot `slot` in block n
    pub fn finesse_offset(&self, n: usize, slot: usize) -> Result<usize, RecordError> {
        Self::check_slot(slot)?;
        let mut pos = self.block_offset(n)? + RAWHEADER_NWORDS + SIZE_COPPER_HEADER;
        for prev in 0..slot {
            pos += self.finesse_words(n, prev)?;
        }
        Ok(pos)
    }

    pub fn finesse_buffer(&self, n: usize, slot: usize) -> Result<&'a [u32], RecordError> {
        let nwords = self.finesse_words(n, slot)?;
        self.range(self.finesse_offset(n, slot)?, nwords)
    }

    pub fn num_finesse_blocks(&self, n: usize) -> Result<usize, RecordError> {
        let mut count = 0;
        for slot in 0..MAX_FINESSE_SLOTS {
            if self.finesse_words(n, slot)? > 0 {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Number of detector payload words in a FINESSE slot, excluding the B2L framing
    pub fn detector_words(&self, n: usize, slot: usize) -> Result<usize, RecordError> {
        let nwords = self.finesse_words(n, slot)?;
        if nwords == 0 {
            return Ok(0);
        }
        nwords
            .checked_sub(FINESSE_FRAMING_NWORDS)
            .ok_or(RecordError::OutOfRange {
                offset: self.finesse_offset(n, slot)? + FINESSE_FRAMING_NWORDS - 1,
                length: self.finesse_offset(n, slot)? + nwords,
            })
    }

    pub fn detector_buffer(&self, n: usize, slot: usize) -> Result<&'a [u32], RecordError> {
        let nwords = self.detector_words(n, slot)?;
        let start = self.finesse_offset(n, slot)? + SIZE_B2LHSLB_HEADER + SIZE_B2LFEE_HEADER;
        self.range(start, nwords)
    }

    /// Word `pos` of the B2L-FEE header of a populated slot, None if the slot is empty
    pub fn fee_header_word(
        &self,
        n: usize,
        slot: usize,
        pos: usize,
    ) -> Result<Option<u32>, RecordError> {
        let nwords = self.finesse_words(n, slot)?;
        if nwords == 0 {
            return Ok(None);
        }
        if pos >= SIZE_B2LFEE_HEADER || nwords < SIZE_B2LHSLB_HEADER + SIZE_B2LFEE_HEADER {
            return Err(RecordError::OutOfRange {
                offset: self.finesse_offset(n, slot)? + SIZE_B2LHSLB_HEADER + pos,
                length: self.finesse_offset(n, slot)? + nwords,
            });
        }
        let offset = self.finesse_offset(n, slot)? + SIZE_B2LHSLB_HEADER + pos;
        Ok(Some(self.word(offset)?))
    }

    /// Read the 32-bit FEE event number from every populated FINESSE slot and require agreement
    pub fn consistent_event_number(&self, n: usize) -> Result<u32, RecordError> {
        let mut values = [None; MAX_FINESSE_SLOTS];
        for (slot, value) in values.iter_mut().enumerate() {
            *value = self.fee_header_word(n, slot, B2LFEE_POS_TT_TAG)?;
        }

        let mut populated = values.iter().flatten();
        let first = match populated.next() {
            Some(first) => *first,
            None => return Err(RecordError::NoFinesseData(n)),
        };

        if populated.any(|value| *value != first) {
            let error = RecordError::EventNumberMismatch { block: n, values };
            match self.event_number_check {
                EventNumberCheck::Strict => return Err(error),
                EventNumberCheck::WarnOnly => spdlog::warn!("{error}"),
            }
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{build_ftsw_block, CopperBlockBuilder};

    fn two_slot_block(eve_no: u32) -> Vec<u32> {
        CopperBlockBuilder::new(eve_no, 0x0301_0001)
            .finesse(0, vec![1, 2, 3])
            .finesse(2, vec![4, 5, 6, 7, 8])
            .build()
    }

    #[test]
    fn test_block_walk() {
        let mut record = build_ftsw_block(10, 0, 0, 0);
        let ftsw_words = record.len();
        record.extend(two_slot_block(10));
        record.extend(two_slot_block(10));
        let view = RawCopper::new(&record, record.len(), 1, 3).unwrap();

        assert_eq!(view.block_offset(0).unwrap(), 0);
        assert_eq!(view.block_offset(1).unwrap(), ftsw_words);
        assert_eq!(
            view.block_offset(2).unwrap(),
            ftsw_words + two_slot_block(10).len()
        );
        assert!(view.check_block_walk().is_ok());
        assert!(view.is_ftsw(0).unwrap());
        assert!(view.is_copper(1).unwrap());
        assert_eq!(
            view.block_offset(3),
            Err(RecordError::BadBlockIndex(3, 3))
        );
    }

    #[test]
    fn test_corrupt_length() {
        let mut record = two_slot_block(1);
        record.extend(two_slot_block(2));
        let total = record.len();
        record[0] = (total + 5) as u32;
        let view = RawCopper::new(&record, total, 1, 2).unwrap();
        assert!(matches!(
            view.block_offset(1),
            Err(RecordError::CorruptLength { block: 0, .. })
        ));
        assert!(view.check_block_walk().is_err());
    }

    #[test]
    fn test_walk_mismatch() {
        let mut record = two_slot_block(1);
        record.push(0);
        let view = RawCopper::single(&record, record.len()).unwrap();
        assert_eq!(
            view.check_block_walk(),
            Err(RecordError::WalkMismatch {
                walked: record.len() - 1,
                length: record.len()
            })
        );
    }

    #[test]
    fn test_header_and_finesse_access() {
        let record = CopperBlockBuilder::new(77, 0x0301_0001)
            .exp_run_subrun((3 << 22) | (120 << 8) | 2)
            .finesse(1, vec![0xAA, 0xBB])
            .build();
        let view = RawCopper::single(&record, record.len()).unwrap();
        let header = view.header(0).unwrap();
        assert_eq!(header.eve_no(), 77);
        assert_eq!(header.node_id(), 0x0301_0001);
        assert_eq!(header.exp_no(), 3);
        assert_eq!(header.run_no(), 120);
        assert_eq!(header.subrun_no(), 2);
        assert_eq!(header.nwords() as usize, record.len());
        assert!(view.trailer(0).unwrap().is_term_valid());

        assert_eq!(view.finesse_words(0, 0).unwrap(), 0);
        assert_eq!(
            view.finesse_words(0, 1).unwrap(),
            2 + FINESSE_FRAMING_NWORDS
        );
        assert_eq!(view.num_finesse_blocks(0).unwrap(), 1);
        assert_eq!(view.detector_buffer(0, 1).unwrap(), &[0xAA, 0xBB]);
        assert!(view.detector_buffer(0, 0).unwrap().is_empty());
        assert_eq!(
            view.finesse_buffer(0, 1).unwrap()[0] & 0xFFFF0000,
            B2LHSLB_HEADER_MAGIC
        );
        assert_eq!(view.finesse_words(0, 4), Err(RecordError::BadFinesseSlot(4)));
        assert!(view.check_copper_length(0).is_ok());
    }

    #[test]
    fn test_out_of_range_accessors() {
        let record = two_slot_block(5);
        // Truncate the view so the tail of the block is missing
        let view = RawCopper::single(&record, RAWHEADER_NWORDS + 4).unwrap();
        assert!(matches!(
            view.finesse_words(0, 0),
            Err(RecordError::OutOfRange { .. })
        ));
        assert!(!view.magic_words_valid(0));
        assert!(RawCopper::single(&record, record.len() + 1).is_err());
    }

    #[test]
    fn test_magic_corruption() {
        let record = two_slot_block(9);
        let view = RawCopper::single(&record, record.len()).unwrap();
        assert!(view.magic_words_valid(0));

        let nwords = record.len();
        let magic_positions = [
            RAWHEADER_NWORDS + POS_MAGIC_COPPER_1,
            RAWHEADER_NWORDS + POS_MAGIC_COPPER_2,
            nwords - RAWTRAILER_NWORDS - NEG_POS_MAGIC_COPPER_3,
            nwords - RAWTRAILER_NWORDS - NEG_POS_MAGIC_COPPER_4,
        ];
        for pos in magic_positions {
            for bit in [0, 7, 16, 31] {
                let mut corrupted = record.clone();
                corrupted[pos] ^= 1 << bit;
                let bad = RawCopper::single(&corrupted, corrupted.len()).unwrap();
                assert!(!bad.magic_words_valid(0));
                assert_eq!(bad.header(0).unwrap().eve_no(), 9);
                assert_eq!(bad.copper_counter(0).unwrap(), 9);
                assert_eq!(
                    bad.detector_buffer(0, 2).unwrap(),
                    view.detector_buffer(0, 2).unwrap()
                );
                assert_eq!(bad.consistent_event_number(0).unwrap(), 9);
            }
        }
    }

    #[test]
    fn test_consistent_event_number() {
        let record = two_slot_block(1000);
        let view = RawCopper::single(&record, record.len()).unwrap();
        assert_eq!(view.consistent_event_number(0).unwrap(), 1000);

        let mut corrupted = record.clone();
        let pos = view.finesse_offset(0, 2).unwrap() + SIZE_B2LHSLB_HEADER + B2LFEE_POS_TT_TAG;
        corrupted[pos] += 1;
        let bad = RawCopper::single(&corrupted, corrupted.len()).unwrap();
        assert_eq!(
            bad.consistent_event_number(0),
            Err(RecordError::EventNumberMismatch {
                block: 0,
                values: [Some(1000), None, Some(1001), None]
            })
        );

        let tolerant = bad.with_event_number_check(EventNumberCheck::WarnOnly);
        assert_eq!(tolerant.consistent_event_number(0).unwrap(), 1000);
    }

    #[test]
    fn test_no_finesse_data() {
        let record = CopperBlockBuilder::new(3, 0x0301_0001).build();
        let view = RawCopper::single(&record, record.len()).unwrap();
        assert_eq!(
            view.consistent_event_number(0),
            Err(RecordError::NoFinesseData(0))
        );
        assert!(view.magic_words_valid(0));
    }
}
