//! Generators for well-formed blocks, for running without front-end hardware.

use super::checksum::xor_checksum;
use super::constants::*;

/// Experiment 1, run 1, subrun 0
pub const DEFAULT_EXP_RUN_SUBRUN: u32 = (1 << 22) | (1 << 8);

/// Node id used for generated FTSW blocks
pub const DUMMY_FTSW_NODE_ID: u32 = FTSW_ID | 0x01;
/// Node id used for generated TLU blocks
pub const DUMMY_TLU_NODE_ID: u32 = TLU_ID | 0x01;

const FTSW_PAYLOAD_NWORDS: usize = 4;
const TLU_PAYLOAD_NWORDS: usize = 2;

/// Builds one COPPER block with valid magics, lengths, FEE headers and checksums.
///
/// FINESSE slots are 0 (A) through 3 (D); slots outside that range are ignored.
#[derive(Debug, Clone)]
pub struct CopperBlockBuilder {
    eve_no: u32,
    node_id: u32,
    exp_run_subrun: u32,
    copper_counter: u32,
    utime: u32,
    ctime_trgtype: u32,
    finesse: [Option<Vec<u32>>; MAX_FINESSE_SLOTS],
}

impl CopperBlockBuilder {
    pub fn new(eve_no: u32, node_id: u32) -> Self {
        Self {
            eve_no,
            node_id,
            exp_run_subrun: DEFAULT_EXP_RUN_SUBRUN,
            copper_counter: eve_no,
            utime: 0,
            ctime_trgtype: 0,
            finesse: Default::default(),
        }
    }

    pub fn exp_run_subrun(mut self, word: u32) -> Self {
        self.exp_run_subrun = word;
        self
    }

    pub fn copper_counter(mut self, counter: u32) -> Self {
        self.copper_counter = counter;
        self
    }

    pub fn times(mut self, utime: u32, ctime_trgtype: u32) -> Self {
        self.utime = utime;
        self.ctime_trgtype = ctime_trgtype;
        self
    }

    /// Fill a FINESSE slot with detector payload
    pub fn finesse(mut self, slot: usize, payload: Vec<u32>) -> Self {
        if let Some(entry) = self.finesse.get_mut(slot) {
            *entry = Some(payload);
        }
        self
    }

    fn finesse_block(&self, slot: usize, payload: &[u32]) -> Vec<u32> {
        let mut words = Vec::with_capacity(payload.len() + FINESSE_FRAMING_NWORDS);
        words.push(B2LHSLB_HEADER_MAGIC | slot as u32);
        let mut fee_header = [0u32; SIZE_B2LFEE_HEADER];
        fee_header[B2LFEE_POS_TTCTIME_TRGTYPE] = self.ctime_trgtype;
        fee_header[B2LFEE_POS_TT_TAG] = self.eve_no;
        fee_header[B2LFEE_POS_TT_UTIME] = self.utime;
        fee_header[B2LFEE_POS_EXP_RUN] = self.exp_run_subrun;
        fee_header[B2LFEE_POS_B2L_CTIME] = self.ctime_trgtype >> 4;
        words.extend_from_slice(&fee_header);
        words.extend_from_slice(payload);
        // FEE trailer carries a 16-bit payload check
        words.push(xor_checksum(payload) & 0xFFFF);
        words.push(B2LHSLB_TRAILER_MAGIC | (self.eve_no & 0xFFFF));
        words
    }

    pub fn build(&self) -> Vec<u32> {
        let finesse: Vec<Vec<u32>> = self
            .finesse
            .iter()
            .enumerate()
            .map(|(slot, payload)| match payload {
                Some(payload) => self.finesse_block(slot, payload),
                None => Vec::new(),
            })
            .collect();
        let finesse_words: usize = finesse.iter().map(|block| block.len()).sum();
        // Counted from the FPGA header magic through the FPGA trailer
        let data_length =
            (SIZE_COPPER_HEADER - POS_MAGIC_COPPER_2) + finesse_words + SIZE_COPPER_FPGA_TRAILER;
        let total = data_length + COPPER_LENGTH_OVERHEAD;

        let mut words = Vec::with_capacity(total);
        push_raw_header(
            &mut words,
            total,
            RawHeaderFields {
                eve_no: self.eve_no,
                node_id: self.node_id,
                exp_run_subrun: self.exp_run_subrun,
                utime: self.utime,
                ctime_trgtype: self.ctime_trgtype,
            },
        );

        let mut copper_header = [0u32; SIZE_COPPER_HEADER];
        copper_header[POS_MAGIC_COPPER_1] = COPPER_MAGIC_DRIVER_HEADER;
        copper_header[POS_EVE_NUM_COPPER] = self.copper_counter;
        copper_header[POS_SUBSYSTEM_PREFIX] = self.node_id >> 24;
        copper_header[POS_COPPER_ID] = self.node_id;
        copper_header[POS_MAGIC_COPPER_2] = COPPER_MAGIC_FPGA_HEADER;
        copper_header[POS_DATA_LENGTH] = data_length as u32;
        for (slot, block) in finesse.iter().enumerate() {
            copper_header[POS_CH_A_DATA_LENGTH + slot] = block.len() as u32;
        }
        words.extend_from_slice(&copper_header);
        for block in &finesse {
            words.extend_from_slice(block);
        }
        words.push(COPPER_MAGIC_FPGA_TRAILER);

        let driver_checksum = xor_checksum(&words[RAWHEADER_NWORDS..]);
        words.push(driver_checksum);
        words.push(COPPER_MAGIC_DRIVER_TRAILER);

        push_raw_trailer(&mut words);
        words
    }
}

struct RawHeaderFields {
    eve_no: u32,
    node_id: u32,
    exp_run_subrun: u32,
    utime: u32,
    ctime_trgtype: u32,
}

fn push_raw_header(words: &mut Vec<u32>, total: usize, fields: RawHeaderFields) {
    let mut raw_header = [0u32; RAWHEADER_NWORDS];
    raw_header[RAWHEADER_POS_NWORDS] = total as u32;
    raw_header[RAWHEADER_POS_VERSION_HDRNWORDS] =
        (RAWHEADER_FORMAT_VERSION << 8) | RAWHEADER_NWORDS as u32;
    raw_header[RAWHEADER_POS_EXP_RUN_NO] = fields.exp_run_subrun;
    raw_header[RAWHEADER_POS_EVE_NO] = fields.eve_no;
    raw_header[RAWHEADER_POS_TTCTIME_TRGTYPE] = fields.ctime_trgtype;
    raw_header[RAWHEADER_POS_TTUTIME] = fields.utime;
    raw_header[RAWHEADER_POS_NODE_ID] = fields.node_id;
    words.extend_from_slice(&raw_header);
}

fn push_raw_trailer(words: &mut Vec<u32>) {
    let checksum = xor_checksum(words);
    words.extend_from_slice(&[0, 0, checksum, MAGIC_WORD_RAW_TRAILER]);
}

/// An FTSW block: raw header, trigger timing payload, raw trailer
pub fn build_ftsw_block(
    eve_no: u32,
    utime: u32,
    ctime_trgtype: u32,
    exp_run_subrun: u32,
) -> Vec<u32> {
    let total = RAWHEADER_NWORDS + FTSW_PAYLOAD_NWORDS + RAWTRAILER_NWORDS;
    let mut words = Vec::with_capacity(total);
    push_raw_header(
        &mut words,
        total,
        RawHeaderFields {
            eve_no,
            node_id: DUMMY_FTSW_NODE_ID,
            exp_run_subrun,
            utime,
            ctime_trgtype,
        },
    );
    words.extend_from_slice(&[ctime_trgtype, utime, eve_no, exp_run_subrun]);
    push_raw_trailer(&mut words);
    words
}

/// A TLU block: raw header, trigger tag payload, raw trailer
pub fn build_tlu_block(eve_no: u32) -> Vec<u32> {
    let total = RAWHEADER_NWORDS + TLU_PAYLOAD_NWORDS + RAWTRAILER_NWORDS;
    let mut words = Vec::with_capacity(total);
    push_raw_header(
        &mut words,
        total,
        RawHeaderFields {
            eve_no,
            node_id: DUMMY_TLU_NODE_ID,
            exp_run_subrun: DEFAULT_EXP_RUN_SUBRUN,
            utime: 0,
            ctime_trgtype: 0,
        },
    );
    words.extend_from_slice(&[eve_no & 0x7FFF, 0]);
    push_raw_trailer(&mut words);
    words
}

/// Produces a sequence of consistent records, one event per record, event numbers from 0.
///
/// Each record holds an optional FTSW block followed by one COPPER block per node id.
#[derive(Debug, Clone)]
pub struct DummyGenerator {
    node_ids: Vec<u32>,
    with_ftsw: bool,
    payload_words: usize,
    exp_run_subrun: u32,
    next_eve_no: u32,
}

impl DummyGenerator {
    pub fn new(node_ids: Vec<u32>, with_ftsw: bool, payload_words: usize) -> Self {
        Self {
            node_ids,
            with_ftsw,
            payload_words,
            exp_run_subrun: DEFAULT_EXP_RUN_SUBRUN,
            next_eve_no: 0,
        }
    }

    pub fn exp_run_subrun(mut self, word: u32) -> Self {
        self.exp_run_subrun = word;
        self
    }

    /// Number of blocks (nodes) in every record
    pub fn num_nodes(&self) -> usize {
        self.node_ids.len() + usize::from(self.with_ftsw)
    }

    pub fn next_eve_no(&self) -> u32 {
        self.next_eve_no
    }

    pub fn next_record(&mut self) -> Vec<u32> {
        let eve_no = self.next_eve_no;
        self.next_eve_no = self.next_eve_no.wrapping_add(1);
        let utime = 0x6000_0000 + eve_no / 1000;
        let ctime = (eve_no.wrapping_mul(0x10)) & 0x7FFF_FFF0;

        let mut record = Vec::new();
        if self.with_ftsw {
            record.extend(build_ftsw_block(eve_no, utime, ctime, self.exp_run_subrun));
        }
        for node_id in &self.node_ids {
            let payload: Vec<u32> = (0..self.payload_words as u32)
                .map(|i| eve_no.wrapping_add(i) ^ node_id)
                .collect();
            record.extend(
                CopperBlockBuilder::new(eve_no, *node_id)
                    .exp_run_subrun(self.exp_run_subrun)
                    .times(utime, ctime)
                    .finesse(0, payload.clone())
                    .finesse(1, payload)
                    .build(),
            );
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{check_driver_checksum, validate_magics};
    use crate::raw_copper::RawCopper;

    #[test]
    fn test_copper_block_layout() {
        let block = CopperBlockBuilder::new(5, 0x0301_0001)
            .finesse(0, vec![1, 2, 3])
            .finesse(3, vec![4])
            .build();
        let data_length = block[RAWHEADER_NWORDS + POS_DATA_LENGTH] as usize;
        assert_eq!(block.len(), data_length + 21);
        assert_eq!(block[0] as usize, block.len());
        assert_eq!(block[block.len() - 7], COPPER_MAGIC_FPGA_TRAILER);
        assert_eq!(block[block.len() - 5], COPPER_MAGIC_DRIVER_TRAILER);
        assert_eq!(block[block.len() - 1], MAGIC_WORD_RAW_TRAILER);

        let view = RawCopper::single(&block, block.len()).unwrap();
        assert!(validate_magics(&view, 0).is_ok());
        assert!(check_driver_checksum(&view, 0).is_ok());
        assert!(view.check_copper_length(0).is_ok());
        assert_eq!(view.detector_buffer(0, 3).unwrap(), &[4]);
    }

    #[test]
    fn test_ftsw_and_tlu_blocks() {
        let ftsw = build_ftsw_block(3, 10, 20, DEFAULT_EXP_RUN_SUBRUN);
        let tlu = build_tlu_block(3);
        let mut record = ftsw.clone();
        record.extend(&tlu);
        let view = RawCopper::new(&record, record.len(), 1, 2).unwrap();
        assert!(view.check_block_walk().is_ok());
        assert!(view.is_ftsw(0).unwrap());
        assert!(view.is_tlu(1).unwrap());
        assert_eq!(view.header(0).unwrap().ttutime(), 10);
        assert!(view.trailer(1).unwrap().is_term_valid());
    }

    #[test]
    fn test_generator_sequence() {
        let mut generator = DummyGenerator::new(vec![0x0301_0001, 0x0301_0002], true, 16);
        assert_eq!(generator.num_nodes(), 3);
        for expected in 0..3 {
            let record = generator.next_record();
            let view = RawCopper::new(&record, record.len(), 1, generator.num_nodes()).unwrap();
            assert!(view.check_block_walk().is_ok());
            for n in 1..3 {
                assert_eq!(view.consistent_event_number(n).unwrap(), expected);
                assert!(view.magic_words_valid(n));
            }
        }
        assert_eq!(generator.next_eve_no(), 3);
    }
}
