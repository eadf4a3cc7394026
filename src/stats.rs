//! Aggregate counters that ride along with the output stream.

/// Mutable aggregate shared by the producer, the progress setters and the
/// final trailer ticket.
///
/// The parallel core keeps one `Statistics` under a mutex. Formats that
/// declare [`totals_in_trailer`](crate::RowFormat::totals_in_trailer) have
/// their totals/extremes batches parked here; the finish ticket takes a
/// snapshot and hands it to [`RowFormat::finish`](crate::RowFormat::finish).
#[derive(Debug)]
pub struct Statistics<R> {
    /// Totals batch routed past the ring, if any.
    pub totals: Option<Vec<R>>,
    /// Extremes batch routed past the ring, if any.
    pub extremes: Option<Vec<R>>,
    /// Number of rows the source read before a LIMIT was applied.
    pub rows_before_limit: Option<u64>,
    /// Number of rows the source read before aggregation collapsed them.
    pub rows_before_aggregation: Option<u64>,
    /// Pre-serialized error message for formats that embed errors in their
    /// trailer. Independent of background-error propagation.
    pub error_message: Option<String>,
}

impl<R> Default for Statistics<R> {
    fn default() -> Self {
        Self {
            totals: None,
            extremes: None,
            rows_before_limit: None,
            rows_before_aggregation: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        let s = Statistics::<String>::default();
        assert!(s.totals.is_none());
        assert!(s.extremes.is_none());
        assert!(s.rows_before_limit.is_none());
        assert!(s.rows_before_aggregation.is_none());
        assert!(s.error_message.is_none());
    }
}
