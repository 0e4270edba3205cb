//! Built-in filters.

pub mod avg;
pub mod delta;
pub mod first;
pub mod last;
pub mod stddev;
pub mod sum;

use omsp_protocol::ValueKind;

use crate::filter::FilterError;

pub(crate) fn require_numeric(
    filter: &'static str,
    kind: ValueKind,
) -> Result<(), FilterError> {
    if kind.is_numeric() {
        Ok(())
    } else {
        Err(FilterError::BadInputKind { filter, kind })
    }
}
