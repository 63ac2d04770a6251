use super::constants::*;
use super::error::{DataCheckError, RecordError};
use super::raw_copper::RawCopper;

/// XOR of every word in `words`. The XOR of an empty slice is 0.
pub fn xor_checksum(words: &[u32]) -> u32 {
    words.iter().fold(0, |acc, word| acc ^ word)
}

/// Check the four COPPER magic words of block `n`
pub fn validate_magics(view: &RawCopper, n: usize) -> Result<(), DataCheckError> {
    let words = view.magic_words(n)?;
    if words
        != [
            COPPER_MAGIC_DRIVER_HEADER,
            COPPER_MAGIC_FPGA_HEADER,
            COPPER_MAGIC_FPGA_TRAILER,
            COPPER_MAGIC_DRIVER_TRAILER,
        ]
    {
        return Err(DataCheckError::BadMagic { entry: n, words });
    }
    Ok(())
}

/// XOR over the COPPER section of block `n`, up to (not including) the driver trailer
pub fn calc_driver_checksum(view: &RawCopper, n: usize) -> Result<u32, RecordError> {
    Ok(xor_checksum(view.driver_checksum_region(n)?))
}

/// Compare the calculated driver checksum of block `n` with the one recorded by the driver
pub fn check_driver_checksum(view: &RawCopper, n: usize) -> Result<(), DataCheckError> {
    let calculated = calc_driver_checksum(view, n)?;
    let recorded = view.recorded_driver_checksum(n)?;
    if calculated != recorded {
        return Err(DataCheckError::DriverChecksum {
            entry: n,
            calculated,
            recorded,
        });
    }
    Ok(())
}
