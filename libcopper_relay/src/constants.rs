/// Size of one data word in bytes. All offsets in this crate are in words.
pub const WORD_SIZE: usize = std::mem::size_of::<u32>();

// Outer send header, prepended to every packet on the wire
pub const SENDHDR_NWORDS: usize = 6;
pub const SENDHDR_POS_NWORDS: usize = 0;
pub const SENDHDR_POS_HDR_NWORDS: usize = 1;
pub const SENDHDR_POS_NUM_EVE_NUM_NODES: usize = 2;
pub const SENDHDR_POS_EXP_RUN_NUMBER: usize = 3;
pub const SENDHDR_POS_EVE_NO: usize = 4;
pub const SENDHDR_POS_NODE_ID: usize = 5;

// Outer send trailer
pub const SENDTRL_NWORDS: usize = 2;
pub const SENDTRL_POS_CHKSUM: usize = 0;
pub const SENDTRL_POS_TERM_WORD: usize = 1;
pub const MAGIC_WORD_SEND_TRAILER: u32 = 0x7FFF0007;

// Raw header at the start of every block (COPPER, FTSW, TLU)
pub const RAWHEADER_NWORDS: usize = 8;
pub const RAWHEADER_POS_NWORDS: usize = 0;
pub const RAWHEADER_POS_VERSION_HDRNWORDS: usize = 1;
pub const RAWHEADER_POS_EXP_RUN_NO: usize = 2;
pub const RAWHEADER_POS_EVE_NO: usize = 3;
pub const RAWHEADER_POS_TTCTIME_TRGTYPE: usize = 4;
pub const RAWHEADER_POS_TTUTIME: usize = 5;
pub const RAWHEADER_POS_NODE_ID: usize = 6;
pub const RAWHEADER_POS_TRUNC_MASK: usize = 7;
pub const RAWHEADER_FORMAT_VERSION: u32 = 4;

// Raw trailer at the end of every block
pub const RAWTRAILER_NWORDS: usize = 4;
pub const RAWTRAILER_POS_CHKSUM: usize = 2;
pub const RAWTRAILER_POS_TERM_WORD: usize = 3;
pub const MAGIC_WORD_RAW_TRAILER: u32 = 0x7FFF0006;

// COPPER section, relative to the end of the raw header
pub const POS_MAGIC_COPPER_1: usize = 0;
pub const POS_EVE_NUM_COPPER: usize = 1;
pub const POS_SUBSYSTEM_PREFIX: usize = 2;
pub const POS_COPPER_ID: usize = 3;
pub const POS_MAGIC_COPPER_2: usize = 7;
pub const POS_DATA_LENGTH: usize = 8;
pub const POS_CH_A_DATA_LENGTH: usize = 9;
pub const SIZE_COPPER_HEADER: usize = 13;
pub const SIZE_COPPER_DRIVER_HEADER: usize = 7;
pub const SIZE_COPPER_DRIVER_TRAILER: usize = 2;
pub const SIZE_COPPER_FPGA_TRAILER: usize = 1;
pub const SIZE_COPPER_TRAILER: usize = SIZE_COPPER_FPGA_TRAILER + SIZE_COPPER_DRIVER_TRAILER;
/// Words of a COPPER block not counted by the DATA_LENGTH field
pub const COPPER_LENGTH_OVERHEAD: usize =
    RAWHEADER_NWORDS + SIZE_COPPER_DRIVER_HEADER + SIZE_COPPER_DRIVER_TRAILER + RAWTRAILER_NWORDS;

// Tail of a COPPER block, counted back from the start of the raw trailer
pub const NEG_POS_MAGIC_COPPER_3: usize = 3;
pub const NEG_POS_CHKSUM_COPPER: usize = 2;
pub const NEG_POS_MAGIC_COPPER_4: usize = 1;

pub const COPPER_MAGIC_DRIVER_HEADER: u32 = 0x7FFF0008;
pub const COPPER_MAGIC_FPGA_HEADER: u32 = 0xFFFFFAFA;
pub const COPPER_MAGIC_FPGA_TRAILER: u32 = 0xFFFFF5F5;
pub const COPPER_MAGIC_DRIVER_TRAILER: u32 = 0x7FFF0009;

// FINESSE sub-block framing
pub const MAX_FINESSE_SLOTS: usize = 4;
pub const SIZE_B2LHSLB_HEADER: usize = 1;
pub const SIZE_B2LFEE_HEADER: usize = 5;
pub const SIZE_B2LFEE_TRAILER: usize = 1;
pub const SIZE_B2LHSLB_TRAILER: usize = 1;
pub const FINESSE_FRAMING_NWORDS: usize =
    SIZE_B2LHSLB_HEADER + SIZE_B2LFEE_HEADER + SIZE_B2LFEE_TRAILER + SIZE_B2LHSLB_TRAILER;
pub const B2LFEE_POS_TTCTIME_TRGTYPE: usize = 0;
pub const B2LFEE_POS_TT_TAG: usize = 1;
pub const B2LFEE_POS_TT_UTIME: usize = 2;
pub const B2LFEE_POS_EXP_RUN: usize = 3;
pub const B2LFEE_POS_B2L_CTIME: usize = 4;
pub const B2LHSLB_HEADER_MAGIC: u32 = 0xFFAA0000;
pub const B2LHSLB_TRAILER_MAGIC: u32 = 0xFF550000;

// Non-COPPER sources, identified by the raw-header node id
pub const SOURCE_ID_MASK: u32 = 0xFFFFFF00;
pub const FTSW_ID: u32 = 0x54300000;
pub const TLU_ID: u32 = 0x544C5500;

/// Largest body (in words) a single send packet may carry
pub const DEFAULT_MAX_EVENT_WORDS: usize = 2_500_000;
