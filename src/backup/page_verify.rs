//! Streaming page checksum verification.
//!
//! The verifier consumes the source byte stream as it is copied and
//! checks each complete page against the cluster's 16-bit checksum.
//! Failures collapse into a compact list of page ordinals and ranges.

use serde_json::{json, Value};

use crate::pg;

/// Outcome of verifying one file's pages.
#[derive(Clone, Debug, PartialEq)]
pub struct PageVerifyResult {
    pub valid: bool,
    /// File size was not a multiple of the page size; no page list is
    /// produced in that case.
    pub misaligned: bool,
    /// Compact failure list, e.g. `[0,[2,3]]`.
    pub error: Option<Value>,
}

impl PageVerifyResult {
    pub fn to_json(&self) -> Value {
        json!({
            "valid": self.valid,
            "misaligned": self.misaligned,
            "error": self.error,
        })
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        Some(Self {
            valid: value["valid"].as_bool()?,
            misaligned: value["misaligned"].as_bool()?,
            error: match &value["error"] {
                Value::Null => None,
                other => Some(other.clone()),
            },
        })
    }
}

/// Whether a file qualifies for page verification: checksums enabled
/// on the cluster, a relation file, non-zero size.
pub fn can_verify_pages(checksum_enabled: bool, is_relation: bool, size: u64) -> bool {
    checksum_enabled && is_relation && size > 0
}

/// Incremental verifier fed from the copy pipeline.
pub struct PageVerifier {
    page_size: usize,
    /// Ordinal of the next page within the whole relation.
    blkno: u32,
    /// Pages with an LSN at or past this limit were written after
    /// backup start; WAL replay repairs them, so they pass.
    lsn_limit: u64,
    partial: Vec<u8>,
    bad_pages: Vec<u32>,
}

impl PageVerifier {
    /// `first_blkno` is the page ordinal the file starts at (non-zero
    /// for relation segment files past the first).
    pub fn new(page_size: usize, first_blkno: u32, lsn_limit: u64) -> Self {
        Self {
            page_size,
            blkno: first_blkno,
            lsn_limit,
            partial: Vec::new(),
            bad_pages: Vec::new(),
        }
    }

    fn verify_page(&mut self, page: &[u8]) {
        let valid = if pg::page_is_new(page) {
            true
        } else if self.lsn_limit > 0 && pg::page_lsn(page) >= self.lsn_limit {
            true
        } else {
            pg::page_checksum(page) == pg::checksum_page(page, self.blkno)
        };
        if !valid {
            self.bad_pages.push(self.blkno);
        }
        self.blkno += 1;
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if !self.partial.is_empty() {
            let need = self.page_size - self.partial.len();
            let take = need.min(data.len());
            self.partial.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.partial.len() == self.page_size {
                let page = std::mem::take(&mut self.partial);
                self.verify_page(&page);
            }
        }
        while data.len() >= self.page_size {
            let (page, rest) = data.split_at(self.page_size);
            self.verify_page(page);
            data = rest;
        }
        if !data.is_empty() {
            self.partial.extend_from_slice(data);
        }
    }

    pub fn finish(self) -> PageVerifyResult {
        if !self.partial.is_empty() {
            // trailing partial page: the file is not page aligned
            return PageVerifyResult {
                valid: false,
                misaligned: true,
                error: None,
            };
        }
        if self.bad_pages.is_empty() {
            return PageVerifyResult {
                valid: true,
                misaligned: false,
                error: None,
            };
        }
        PageVerifyResult {
            valid: false,
            misaligned: false,
            error: Some(compact_page_list(&self.bad_pages)),
        }
    }
}

/// Collapse sorted page ordinals into `[page, [first, last], ...]`.
fn compact_page_list(pages: &[u32]) -> Value {
    let mut list = Vec::new();
    let mut iter = pages.iter().copied().peekable();
    while let Some(first) = iter.next() {
        let mut last = first;
        while iter.peek() == Some(&(last + 1)) {
            last = iter.next().unwrap();
        }
        if first == last {
            list.push(json!(first));
        } else {
            list.push(json!([first, last]));
        }
    }
    Value::Array(list)
}

#[cfg(test)]
mod test {
    use super::*;

    const PAGE_SIZE: usize = 8192;

    fn valid_page(blkno: u32, fill: u8) -> Vec<u8> {
        let mut page = vec![fill; PAGE_SIZE];
        page[0..8].copy_from_slice(&[0u8; 8]);
        page[pg::PAGE_HEADER_UPPER_OFFSET] = 0x20;
        page[pg::PAGE_HEADER_UPPER_OFFSET + 1] = 0x00;
        pg::page_set_checksum(&mut page, blkno);
        page
    }

    fn broken_page(fill: u8) -> Vec<u8> {
        let mut page = vec![fill; PAGE_SIZE];
        page[0..8].copy_from_slice(&[0u8; 8]);
        page[pg::PAGE_HEADER_UPPER_OFFSET] = 0xFF;
        page
    }

    #[test]
    fn test_all_valid() {
        let mut verifier = PageVerifier::new(PAGE_SIZE, 0, 0);
        for blkno in 0..4 {
            verifier.update(&valid_page(blkno, 0x10));
        }
        let result = verifier.finish();
        assert!(result.valid);
        assert!(!result.misaligned);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_new_page_is_valid() {
        let mut verifier = PageVerifier::new(PAGE_SIZE, 0, 0);
        verifier.update(&vec![0u8; PAGE_SIZE]);
        assert!(verifier.finish().valid);
    }

    #[test]
    fn test_failures_collapse_to_ranges() {
        // pages 0, 2, 3 broken; page 1 valid -> [0,[2,3]]
        let mut verifier = PageVerifier::new(PAGE_SIZE, 0, 0);
        verifier.update(&broken_page(0x01));
        verifier.update(&valid_page(1, 0x02));
        verifier.update(&broken_page(0x03));
        verifier.update(&broken_page(0x04));
        let result = verifier.finish();
        assert!(!result.valid);
        assert_eq!(result.error, Some(json!([0, [2, 3]])));
    }

    #[test]
    fn test_split_feeds() {
        let page = valid_page(0, 0x55);
        let mut verifier = PageVerifier::new(PAGE_SIZE, 0, 0);
        verifier.update(&page[..1000]);
        verifier.update(&page[1000..5000]);
        verifier.update(&page[5000..]);
        assert!(verifier.finish().valid);
    }

    #[test]
    fn test_misaligned_file() {
        let mut verifier = PageVerifier::new(PAGE_SIZE, 0, 0);
        verifier.update(&valid_page(0, 0x10));
        verifier.update(&[0u8; 100]);
        let result = verifier.finish();
        assert!(!result.valid);
        assert!(result.misaligned);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_lsn_limit_passes_recent_pages() {
        let mut page = broken_page(0x77);
        // page lsn 5/0
        page[0..4].copy_from_slice(&5u32.to_le_bytes());
        let mut verifier = PageVerifier::new(PAGE_SIZE, 0, 4u64 << 32);
        verifier.update(&page);
        assert!(verifier.finish().valid);
    }

    #[test]
    fn test_segment_offset_blkno() {
        // a file starting at page 131072 must validate with that blkno
        let mut verifier = PageVerifier::new(PAGE_SIZE, 131072, 0);
        verifier.update(&valid_page(131072, 0x21));
        assert!(verifier.finish().valid);
    }

    #[test]
    fn test_result_json_roundtrip() {
        let result = PageVerifyResult {
            valid: false,
            misaligned: false,
            error: Some(json!([1, [4, 6]])),
        };
        let decoded = PageVerifyResult::from_json(&result.to_json()).unwrap();
        assert_eq!(result, decoded);
    }

    #[test]
    fn test_can_verify_pages() {
        assert!(can_verify_pages(true, true, 8192));
        assert!(!can_verify_pages(false, true, 8192));
        assert!(!can_verify_pages(true, false, 8192));
        assert!(!can_verify_pages(true, true, 0));
    }
}
