use super::checksum::{check_driver_checksum, validate_magics};
use super::constants::*;
use super::error::DataCheckError;
use super::raw_copper::{EventNumberCheck, RawCopper};

/// Identity of the last event checked, carried over to the next record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PrevEvent {
    eve_no: u32,
    copper_counter: u32,
    exp_run_subrun: u32,
}

fn run_no(exp_run_subrun: u32) -> u32 {
    (exp_run_subrun >> 8) & 0x3FFF
}

/// Per-event consistency checks over a received record.
///
/// For every COPPER block: magic words, raw-header event number against the FEE event
/// number, event number and COPPER counter incrementing by one within a run, event number
/// zero at the start of a new run, FINESSE time agreement, and the driver checksum. Across
/// the nodes of one event the event number, utime and ctime must agree. FTSW and TLU blocks
/// only contribute their header values to the cross-node comparison.
///
/// With [`EventNumberCheck::WarnOnly`] every failure is logged and the record accepted.
#[derive(Debug, Clone)]
pub struct EventChecker {
    mode: EventNumberCheck,
    prev: Option<PrevEvent>,
}

impl EventChecker {
    pub fn new(mode: EventNumberCheck) -> Self {
        Self { mode, prev: None }
    }

    /// Forget the previous event, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.prev = None;
    }

    pub fn prev_eve_no(&self) -> Option<u32> {
        self.prev.map(|prev| prev.eve_no)
    }

    fn report(&self, error: DataCheckError) -> Result<(), DataCheckError> {
        match self.mode {
            EventNumberCheck::Strict => Err(error),
            EventNumberCheck::WarnOnly => {
                spdlog::warn!("{error}");
                Ok(())
            }
        }
    }

    pub fn check(&mut self, view: &RawCopper) -> Result<(), DataCheckError> {
        let num_nodes = view.num_nodes();
        for event in 0..view.num_events() {
            let mut records: Vec<(u32, Option<u32>, Option<u32>)> = Vec::with_capacity(num_nodes);
            let mut current = self.prev;

            for node in 0..num_nodes {
                let entry = node + event * num_nodes;
                let header = view.header(entry)?;
                if view.is_tlu(entry)? {
                    records.push((header.eve_no(), None, None));
                    continue;
                }
                records.push((
                    header.eve_no(),
                    Some(header.ttutime()),
                    Some(header.ttctime_trgtype()),
                ));
                if view.is_ftsw(entry)? {
                    continue;
                }

                current = Some(self.check_copper(view, entry)?);
            }

            self.check_nodes(event, &records)?;
            self.prev = current;
        }
        Ok(())
    }

    fn check_copper(&self, view: &RawCopper, entry: usize) -> Result<PrevEvent, DataCheckError> {
        if let Err(error) = validate_magics(view, entry) {
            self.report(error)?;
        }

        let header = view.header(entry)?;
        let cur = PrevEvent {
            eve_no: header.eve_no(),
            copper_counter: view.copper_counter(entry)?,
            exp_run_subrun: header.exp_run_subrun(),
        };

        let fee = view.consistent_event_number(entry)?;
        if fee != cur.eve_no {
            self.report(DataCheckError::FeeEventMismatch {
                entry,
                header: cur.eve_no,
                fee,
            })?;
        }

        match self.prev {
            Some(prev) if prev.exp_run_subrun == cur.exp_run_subrun => {
                if prev.eve_no.wrapping_add(1) != cur.eve_no {
                    self.report(DataCheckError::EventJump {
                        entry,
                        prev: prev.eve_no,
                        cur: cur.eve_no,
                    })?;
                }
                if prev.copper_counter.wrapping_add(1) != cur.copper_counter {
                    self.report(DataCheckError::CopperCounterJump {
                        entry,
                        prev: prev.copper_counter,
                        cur: cur.copper_counter,
                    })?;
                }
            }
            Some(prev) => {
                spdlog::info!(
                    "New run started. cur run {:08x} prev run {:08x} cur eve {:#x} prev eve {:#x}",
                    cur.exp_run_subrun,
                    prev.exp_run_subrun,
                    cur.eve_no,
                    prev.eve_no
                );
                if run_no(prev.exp_run_subrun) != run_no(cur.exp_run_subrun) && cur.eve_no != 0 {
                    self.report(DataCheckError::RunStartEvent {
                        entry,
                        prev_run: prev.exp_run_subrun,
                        cur_run: cur.exp_run_subrun,
                        cur: cur.eve_no,
                    })?;
                }
            }
            None => (),
        }

        self.check_finesse_times(view, entry)?;

        if let Err(error) = check_driver_checksum(view, entry) {
            self.report(error)?;
        }
        Ok(cur)
    }

    fn check_finesse_times(&self, view: &RawCopper, entry: usize) -> Result<(), DataCheckError> {
        let mut utimes = [None; MAX_FINESSE_SLOTS];
        let mut ctimes = [None; MAX_FINESSE_SLOTS];
        for slot in 0..MAX_FINESSE_SLOTS {
            utimes[slot] = view.fee_header_word(entry, slot, B2LFEE_POS_TT_UTIME)?;
            ctimes[slot] = view.fee_header_word(entry, slot, B2LFEE_POS_TTCTIME_TRGTYPE)?;
        }
        let agree = |values: &[Option<u32>]| {
            let mut populated = values.iter().flatten();
            match populated.next() {
                Some(first) => populated.all(|value| value == first),
                None => true,
            }
        };
        if !agree(&utimes) || !agree(&ctimes) {
            self.report(DataCheckError::FinesseTimeMismatch {
                entry,
                utimes,
                ctimes,
            })?;
        }
        Ok(())
    }

    fn check_nodes(
        &self,
        event: usize,
        records: &[(u32, Option<u32>, Option<u32>)],
    ) -> Result<(), DataCheckError> {
        let Some(&(eve_no, _, _)) = records.first() else {
            return Ok(());
        };
        let utime = records.iter().find_map(|record| record.1);
        let ctime = records.iter().find_map(|record| record.2);
        let consistent = records.iter().all(|record| {
            record.0 == eve_no
                && record.1.map_or(true, |value| Some(value) == utime)
                && record.2.map_or(true, |value| Some(value) == ctime)
        });
        if !consistent {
            for (node, record) in records.iter().enumerate() {
                spdlog::debug!(
                    "node {} eve # {} utime {:x?} ctime {:x?}",
                    node,
                    record.0,
                    record.1,
                    record.2
                );
            }
            self.report(DataCheckError::NodeMismatch {
                event,
                records: records
                    .iter()
                    .map(|record| (record.0, record.1.unwrap_or(0), record.2.unwrap_or(0)))
                    .collect(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{build_tlu_block, CopperBlockBuilder, DummyGenerator, DEFAULT_EXP_RUN_SUBRUN};

    const NODES: [u32; 2] = [0x0301_0001, 0x0301_0002];

    fn check_record(
        checker: &mut EventChecker,
        record: &[u32],
        num_nodes: usize,
    ) -> Result<(), DataCheckError> {
        let view = RawCopper::new(record, record.len(), 1, num_nodes).unwrap();
        checker.check(&view)
    }

    fn copper(eve_no: u32, node_id: u32) -> CopperBlockBuilder {
        CopperBlockBuilder::new(eve_no, node_id)
            .times(0x6000_0000, eve_no << 4)
            .finesse(0, vec![1, 2, 3])
            .finesse(1, vec![4, 5])
    }

    #[test]
    fn test_sequence_passes() {
        let mut generator = DummyGenerator::new(NODES.to_vec(), true, 8);
        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        for _ in 0..5 {
            let record = generator.next_record();
            check_record(&mut checker, &record, generator.num_nodes()).unwrap();
        }
        assert_eq!(checker.prev_eve_no(), Some(4));
    }

    #[test]
    fn test_event_jump() {
        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        check_record(&mut checker, &copper(10, NODES[0]).build(), 1).unwrap();
        let err = check_record(&mut checker, &copper(12, NODES[0]).build(), 1).unwrap_err();
        assert_eq!(
            err,
            DataCheckError::EventJump {
                entry: 0,
                prev: 10,
                cur: 12
            }
        );
    }

    #[test]
    fn test_copper_counter_jump() {
        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        check_record(&mut checker, &copper(10, NODES[0]).build(), 1).unwrap();
        let next = copper(11, NODES[0]).copper_counter(20).build();
        assert!(matches!(
            check_record(&mut checker, &next, 1),
            Err(DataCheckError::CopperCounterJump { prev: 10, cur: 20, .. })
        ));
    }

    #[test]
    fn test_fee_event_mismatch() {
        let mut record = copper(10, NODES[0]).build();
        record[RAWHEADER_POS_EVE_NO] = 11;
        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        assert_eq!(
            check_record(&mut checker, &record, 1),
            Err(DataCheckError::FeeEventMismatch {
                entry: 0,
                header: 11,
                fee: 10
            })
        );
    }

    #[test]
    fn test_bad_magic_and_driver_checksum() {
        let mut record = copper(1, NODES[0]).build();
        record[RAWHEADER_NWORDS + POS_MAGIC_COPPER_1] = 0;
        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        assert!(matches!(
            check_record(&mut checker, &record, 1),
            Err(DataCheckError::BadMagic { entry: 0, .. })
        ));

        let mut record = copper(1, NODES[0]).build();
        let len = record.len();
        record[len - RAWTRAILER_NWORDS - NEG_POS_CHKSUM_COPPER] ^= 0xFF;
        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        assert!(matches!(
            check_record(&mut checker, &record, 1),
            Err(DataCheckError::DriverChecksum { entry: 0, .. })
        ));
    }

    #[test]
    fn test_node_mismatch() {
        let mut record = copper(5, NODES[0]).build();
        record.extend(copper(5, NODES[1]).times(0x6000_0001, 5 << 4).build());
        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        assert!(matches!(
            check_record(&mut checker, &record, 2),
            Err(DataCheckError::NodeMismatch { event: 0, .. })
        ));

        // A TLU only has to agree on the event number
        let mut record = copper(5, NODES[0]).build();
        record.extend(build_tlu_block(5));
        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        assert!(check_record(&mut checker, &record, 2).is_ok());
    }

    #[test]
    fn test_run_start() {
        let run_1 = DEFAULT_EXP_RUN_SUBRUN;
        let run_2 = DEFAULT_EXP_RUN_SUBRUN + (1 << 8);
        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        check_record(&mut checker, &copper(7, NODES[0]).exp_run_subrun(run_1).build(), 1).unwrap();
        assert!(matches!(
            check_record(&mut checker, &copper(3, NODES[0]).exp_run_subrun(run_2).build(), 1),
            Err(DataCheckError::RunStartEvent { cur: 3, .. })
        ));

        let mut checker = EventChecker::new(EventNumberCheck::Strict);
        check_record(&mut checker, &copper(7, NODES[0]).exp_run_subrun(run_1).build(), 1).unwrap();
        check_record(&mut checker, &copper(0, NODES[0]).exp_run_subrun(run_2).build(), 1).unwrap();
        check_record(&mut checker, &copper(1, NODES[0]).exp_run_subrun(run_2).build(), 1).unwrap();
    }

    #[test]
    fn test_warn_only_accepts() {
        let mut checker = EventChecker::new(EventNumberCheck::WarnOnly);
        check_record(&mut checker, &copper(10, NODES[0]).build(), 1).unwrap();
        let mut record = copper(15, NODES[0]).copper_counter(3).build();
        record[RAWHEADER_NWORDS + POS_MAGIC_COPPER_2] = 0;
        check_record(&mut checker, &record, 1).unwrap();
        assert_eq!(checker.prev_eve_no(), Some(15));
    }
}
