/// Best-known size of the media a job produces.
///
/// The estimate only ever grows: once a size is known, a later and smaller
/// report does not replace it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeEstimate {
    bytes: Option<u64>,
    exact: bool,
}

impl SizeEstimate {
    /// Whether any size has been detected yet
    pub fn is_known(&self) -> bool {
        self.bytes.is_some()
    }

    pub fn bytes(&self) -> Option<u64> {
        self.bytes
    }

    /// The size, only when it comes from a byte-exact report
    pub fn exact_bytes(&self) -> Option<u64> {
        self.bytes.filter(|_| self.exact)
    }

    /// Record a byte-exact count found by a fallback pattern.
    ///
    /// Only the first non-zero count is kept.
    pub fn observe_hint(&mut self, bytes: u64) {
        if self.bytes.is_none() && bytes > 0 {
            self.bytes = Some(bytes);
            self.exact = true;
        }
    }

    /// Record the total announced by a progress report. These totals are
    /// rounded by the extractor, so they never count as exact.
    pub fn observe_total(&mut self, bytes: u64) {
        if self.bytes.map_or(true, |current| bytes > current) {
            self.bytes = Some(bytes);
            self.exact = false;
        }
    }
}
