//! Report assembly.
//!
//! A report is one logical wire message: the recorder's shared header
//! frame, a metrics frame carrying the dropped-span count, then the span
//! frames of the current allotment referenced without copying.

use spanring::{BlockAllocator, FragmentChain, RingError};
use std::sync::Arc;

/// One batched report, ready for the write pump.
pub(crate) struct ReportRequest {
    /// Encoded header frame, shared across every report of this recorder.
    header: Arc<Vec<u8>>,
    /// Encoded metrics frame.
    metrics: Vec<u8>,
    /// Span frames referencing the ring allotment.
    spans: FragmentChain,
    num_spans: usize,
    span_bytes: usize,
    num_bytes: usize,
    dropped_count: u64,
}

impl ReportRequest {
    pub fn new(
        header: Arc<Vec<u8>>,
        metrics: Vec<u8>,
        dropped_count: u64,
        allocator: Arc<BlockAllocator>,
    ) -> Self {
        let num_bytes = header.len() + metrics.len();
        Self {
            header,
            metrics,
            spans: FragmentChain::new(allocator),
            num_spans: 0,
            span_bytes: 0,
            num_bytes,
            dropped_count,
        }
    }

    /// Attaches the allotted span region (up to two linear slices holding
    /// `num_spans` whole frames).
    ///
    /// # Safety
    ///
    /// The slices must reference the ring allotment and the allotment must
    /// not be consumed while this report is alive.
    pub unsafe fn add_span_region(
        &mut self,
        region: (&[u8], &[u8]),
        num_spans: usize,
    ) -> Result<(), RingError> {
        // SAFETY: forwarded caller contract; the ring outlives the report.
        unsafe {
            self.spans.push(region.0.as_ptr(), region.0.len())?;
            self.spans.push(region.1.as_ptr(), region.1.len())?;
        }
        let added = region.0.len() + region.1.len();
        self.span_bytes += added;
        self.num_bytes += added;
        self.num_spans += num_spans;
        Ok(())
    }

    /// Total bytes this report puts on the wire. Memoized on assembly.
    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    /// Whole span frames carried by this report.
    pub fn num_spans(&self) -> usize {
        self.num_spans
    }

    /// Bytes of the span region; the amount to consume from the ring once
    /// the report is acked (or dropped).
    pub fn span_bytes(&self) -> usize {
        self.span_bytes
    }

    /// Dropped-span count carried in the metrics frame.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    /// Yields the report's fragments in wire order, stopping early when
    /// `f` returns `false`.
    pub fn for_each_fragment<'a, F>(&'a self, mut f: F) -> bool
    where
        F: FnMut(&'a [u8]) -> bool,
    {
        if !f(self.header.as_slice()) {
            return false;
        }
        if !self.metrics.is_empty() && !f(self.metrics.as_slice()) {
            return false;
        }
        self.spans.for_each_fragment(f)
    }

    /// The `index`-th fragment in wire order.
    pub fn fragment(&self, index: usize) -> Option<&[u8]> {
        let mut remaining = index;
        let mut found = None;
        self.for_each_fragment(|fragment| {
            if remaining == 0 {
                found = Some(fragment);
                false
            } else {
                remaining -= 1;
                true
            }
        });
        found
    }
}

/// Byte position within a report's fragment sequence.
///
/// The write pump resumes partial writes from here; a failover resets it
/// so the report restarts from byte zero on the next connection.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FragmentCursor {
    fragment: usize,
    offset: usize,
}

impl FragmentCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unwritten remainder of the current fragment, or `None` when the
    /// whole report has been written.
    pub fn current<'a>(&self, report: &'a ReportRequest) -> Option<&'a [u8]> {
        report
            .fragment(self.fragment)
            .map(|fragment| &fragment[self.offset..])
    }

    /// Advances by `n` written bytes, moving across fragment boundaries.
    pub fn advance(&mut self, report: &ReportRequest, mut n: usize) {
        while n > 0 {
            let Some(fragment) = report.fragment(self.fragment) else {
                debug_assert!(false, "cursor advanced past the report");
                return;
            };
            let remaining = fragment.len() - self.offset;
            if n >= remaining {
                n -= remaining;
                self.fragment += 1;
                self.offset = 0;
            } else {
                self.offset += n;
                n = 0;
            }
        }
    }

    /// Restarts the report from its first byte.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanring::CHAIN_NODE_BLOCK_SIZE;

    fn allocator() -> Arc<BlockAllocator> {
        Arc::new(BlockAllocator::new(CHAIN_NODE_BLOCK_SIZE, 4))
    }

    fn report_over(region: &'static [u8], split: usize) -> ReportRequest {
        let header = Arc::new(vec![0xAA; 4]);
        let metrics = vec![0xBB; 3];
        let mut report = ReportRequest::new(header, metrics, 2, allocator());
        // SAFETY: 'static region outlives the report.
        unsafe {
            report
                .add_span_region((&region[..split], &region[split..]), 2)
                .unwrap();
        }
        report
    }

    const REGION: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8];

    #[test]
    fn fragments_appear_in_wire_order() {
        let report = report_over(REGION, 5);
        assert_eq!(report.num_bytes(), 4 + 3 + 8);
        assert_eq!(report.span_bytes(), 8);
        assert_eq!(report.num_spans(), 2);
        assert_eq!(report.dropped_count(), 2);

        let mut collected = Vec::new();
        report.for_each_fragment(|fragment| {
            collected.push(fragment.to_vec());
            true
        });
        assert_eq!(
            collected,
            vec![
                vec![0xAA; 4],
                vec![0xBB; 3],
                vec![1, 2, 3, 4, 5],
                vec![6, 7, 8],
            ]
        );

        assert_eq!(report.fragment(0), Some(&[0xAA, 0xAA, 0xAA, 0xAA][..]));
        assert_eq!(report.fragment(3), Some(&[6, 7, 8][..]));
        assert_eq!(report.fragment(4), None);
    }

    #[test]
    fn empty_second_slice_is_skipped() {
        let report = report_over(REGION, REGION.len());
        let mut count = 0;
        report.for_each_fragment(|_| {
            count += 1;
            true
        });
        assert_eq!(count, 3);
    }

    #[test]
    fn cursor_walks_across_fragment_boundaries() {
        let report = report_over(REGION, 5);
        let mut cursor = FragmentCursor::new();

        assert_eq!(cursor.current(&report).unwrap().len(), 4);
        cursor.advance(&report, 2);
        assert_eq!(cursor.current(&report), Some(&[0xAA, 0xAA][..]));

        // Finish the header, the metrics frame and one span byte.
        cursor.advance(&report, 2 + 3 + 1);
        assert_eq!(cursor.current(&report), Some(&[2, 3, 4, 5][..]));

        cursor.advance(&report, 4 + 3);
        assert!(cursor.current(&report).is_none());

        cursor.reset();
        assert_eq!(cursor.current(&report).unwrap().len(), 4);
    }
}
