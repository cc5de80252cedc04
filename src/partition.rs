use crate::domain::SpotRange;
use crate::error::SraError;

/// Splits `[1, total]` into `chunks` contiguous ranges of `total / chunks`
/// spots each; the last range absorbs the remainder.
///
/// Asking for more chunks than spots is rejected rather than clamped, so a
/// caller never receives an empty range.
pub fn partition(total: u64, chunks: u64) -> Result<Vec<SpotRange>, SraError> {
    if total == 0 || chunks == 0 || chunks > total {
        return Err(SraError::InvalidPartition { total, chunks });
    }
    let size = total / chunks;
    let mut ranges = (0..chunks)
        .map(|i| SpotRange {
            start: 1 + i * size,
            end: size + i * size,
        })
        .collect::<Vec<_>>();
    if let Some(last) = ranges.last_mut() {
        last.end = total;
    }
    Ok(ranges)
}
