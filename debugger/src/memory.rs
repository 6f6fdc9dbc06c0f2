// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Debuggee virtual-memory access: page-safe reads, writes that tolerate
//! read-only targets, and a wildcard pattern scan over committed regions.

use std::str::FromStr;

use anyhow::{Context, Result};
use log::trace;
use win_util::{memory, process};
use winapi::um::winnt::{HANDLE, PAGE_EXECUTE_READWRITE};

use crate::{breakpoint::SwBreakpointTable, error::DebuggerError};

const PAGE_SIZE: usize = 0x1000;

/// Upper bound on a single remote read during a region scan.
const SEARCH_CHUNK_SIZE: usize = 1024 * 1024;

/// Read up to `len` bytes, never crossing a page boundary in one OS call so
/// a partially-unmapped range yields the readable prefix instead of nothing.
pub(crate) fn read_prefix(process_handle: HANDLE, address: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let mut read = 0usize;

    while read < len {
        let page_remaining =
            (PAGE_SIZE as u64 - (address.wrapping_add(read as u64) % PAGE_SIZE as u64)) as usize;
        let chunk = page_remaining.min(len - read);
        let remote = address.wrapping_add(read as u64) as _;

        if process::read_memory_array(process_handle, remote, &mut buf[read..read + chunk]).is_err()
        {
            break;
        }
        read += chunk;
    }

    buf.truncate(read);
    buf
}

/// Like `read_prefix`, but a short transfer is an error carrying how far the
/// read got.
pub(crate) fn read_exact(process_handle: HANDLE, address: u64, len: usize) -> Result<Vec<u8>> {
    let buf = read_prefix(process_handle, address, len);
    if buf.len() != len {
        let read = buf.len();
        return Err(DebuggerError::MemoryReadShort {
            requested: len,
            read,
        })
        .with_context(|| format!("reading {} bytes at 0x{:x}", len, address));
    }
    Ok(buf)
}

/// Write through existing page protections: if the range is not writable,
/// temporarily grant `PAGE_EXECUTE_READWRITE` and restore the previous
/// protection afterwards. The instruction cache is flushed in case the
/// write patched code.
pub(crate) fn write_through(process_handle: HANDLE, address: u64, buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }

    let info = memory::get_memory_info(process_handle, address)?;
    let reprotect = if info.is_writable() {
        None
    } else {
        let old = memory::virtual_protect(
            process_handle,
            address,
            buf.len(),
            PAGE_EXECUTE_READWRITE,
        )
        .map_err(|e| e.context(DebuggerError::MemoryWriteProtected { address }))?;
        Some(old)
    };

    let result = process::write_memory_slice(process_handle, address as _, buf)
        .and_then(|_| process::flush_instruction_cache(process_handle, address as _, buf.len()));

    if let Some(old_protection) = reprotect {
        memory::virtual_protect(process_handle, address, buf.len(), old_protection)?;
    }

    result
}

/// A byte pattern where `None` matches any byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<Option<u8>>,
}

impl Pattern {
    pub fn new(bytes: Vec<Option<u8>>) -> Result<Self> {
        anyhow::ensure!(!bytes.is_empty(), "empty search pattern");
        Ok(Pattern { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        self.bytes
            .iter()
            .zip(window)
            .all(|(p, b)| p.map_or(true, |p| p == *b))
    }

    /// Offsets of every match within `buf`.
    pub(crate) fn find_in(&self, buf: &[u8]) -> Vec<usize> {
        let len = self.bytes.len();
        if buf.len() < len {
            return Vec::new();
        }

        (0..=buf.len() - len)
            .filter(|&offset| self.matches_at(&buf[offset..offset + len]))
            .collect()
    }
}

impl From<&[u8]> for Pattern {
    fn from(bytes: &[u8]) -> Self {
        Pattern {
            bytes: bytes.iter().copied().map(Some).collect(),
        }
    }
}

impl From<Vec<u8>> for Pattern {
    fn from(bytes: Vec<u8>) -> Self {
        Pattern::from(&bytes[..])
    }
}

impl<const N: usize> From<&[u8; N]> for Pattern {
    fn from(bytes: &[u8; N]) -> Self {
        Pattern::from(&bytes[..])
    }
}

impl FromStr for Pattern {
    type Err = anyhow::Error;

    /// Whitespace-separated hex bytes; `?` or `??` is a wildcard, e.g.
    /// `"de ad ?? ef"`.
    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        for token in s.split_whitespace() {
            if token == "?" || token == "??" {
                bytes.push(None);
            } else {
                let byte = u8::from_str_radix(token, 16)
                    .with_context(|| format!("bad pattern byte {:?}", token))?;
                bytes.push(Some(byte));
            }
        }
        Pattern::new(bytes)
    }
}

/// Chunk a region of `region_size` bytes into `(offset, len)` spans of at
/// most `max_chunk` bytes, overlapping by `pattern_len - 1` so a match
/// spanning two chunks is still seen whole by one of them.
pub(crate) fn chunk_spans(
    region_size: usize,
    pattern_len: usize,
    max_chunk: usize,
) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    if region_size < pattern_len || pattern_len == 0 {
        return spans;
    }

    let chunk = max_chunk.max(pattern_len * 2);
    let step = chunk - (pattern_len - 1);

    let mut offset = 0usize;
    loop {
        let len = chunk.min(region_size - offset);
        spans.push((offset, len));
        if offset + len >= region_size {
            break;
        }
        offset += step;
    }
    spans
}

/// Walk the debuggee's address space and collect every committed,
/// non-guard, readable region as `(base, size)`.
pub(crate) fn committed_regions(process_handle: HANDLE) -> Vec<(u64, u64)> {
    let mut regions = Vec::new();
    let mut address = 0u64;

    // The walk ends when VirtualQueryEx fails past the last user region.
    while let Ok(info) = memory::get_memory_info(process_handle, address) {
        let next = info.next_region_base();
        if next <= address {
            break;
        }

        if info.is_committed() && info.is_readable() {
            regions.push((info.base_address(), info.region_size()));
        }

        address = next;
    }

    regions
}

/// Scan every committed, non-guard, readable region for `pattern`,
/// substituting saved original bytes for armed breakpoint shadows before
/// matching. Returns absolute addresses of all matches.
pub(crate) fn search_committed_regions(
    process_handle: HANDLE,
    pattern: &Pattern,
    breakpoints: &SwBreakpointTable,
) -> Result<Vec<u64>> {
    let mut results = Vec::new();

    for (base, size) in committed_regions(process_handle) {
        search_region(
            process_handle,
            base,
            size as usize,
            pattern,
            breakpoints,
            &mut results,
        );
    }

    trace!(
        "pattern scan: {} match(es) of a {}-byte pattern",
        results.len(),
        pattern.len()
    );
    Ok(results)
}

fn search_region(
    process_handle: HANDLE,
    base: u64,
    size: usize,
    pattern: &Pattern,
    breakpoints: &SwBreakpointTable,
    results: &mut Vec<u64>,
) {
    for (offset, len) in chunk_spans(size, pattern.len(), SEARCH_CHUNK_SIZE) {
        let chunk_base = base + offset as u64;
        let mut buf = read_prefix(process_handle, chunk_base, len);
        if buf.len() < pattern.len() {
            continue;
        }

        breakpoints.overlay_original_bytes(chunk_base, &mut buf);

        for m in pattern.find_in(&buf) {
            results.push(chunk_base + m as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_parse() {
        let pattern: Pattern = "de ad ?? ef".parse().unwrap();
        assert_eq!(pattern.len(), 4);
        assert!(pattern.matches_at(&[0xde, 0xad, 0x42, 0xef]));
        assert!(!pattern.matches_at(&[0xde, 0xad, 0x42, 0xee]));

        assert!("".parse::<Pattern>().is_err());
        assert!("xy".parse::<Pattern>().is_err());
    }

    #[test]
    fn find_all_matches() {
        let pattern = Pattern::from(&[0xde, 0xad, 0xbe, 0xef]);
        let mut buf = vec![0u8; 64];
        for base in [0, 13, 60 - 4] {
            buf[base..base + 4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        }

        assert_eq!(pattern.find_in(&buf), vec![0, 13, 56]);
    }

    #[test]
    fn find_overlapping_matches() {
        let pattern: Pattern = "aa ?? aa".parse().unwrap();
        let buf = [0xaa, 0xbb, 0xaa, 0xcc, 0xaa];
        assert_eq!(pattern.find_in(&buf), vec![0, 2]);
    }

    #[test]
    fn short_buffer_has_no_matches() {
        let pattern = Pattern::from(&[1, 2, 3]);
        assert!(pattern.find_in(&[1, 2]).is_empty());
    }

    #[test]
    fn chunks_cover_region_with_overlap() {
        let spans = chunk_spans(100, 4, 32);

        // Every byte covered, consecutive spans overlap by pattern_len - 1.
        assert_eq!(spans.first(), Some(&(0, 32)));
        for pair in spans.windows(2) {
            let (off_a, len_a) = pair[0];
            let (off_b, _) = pair[1];
            assert_eq!(off_a + len_a - off_b, 3);
        }
        let (last_off, last_len) = *spans.last().unwrap();
        assert_eq!(last_off + last_len, 100);

        // A match that would straddle a naive 32-byte boundary lies whole in
        // some span.
        let start = 30usize;
        assert!(spans
            .iter()
            .any(|&(off, len)| start >= off && start + 4 <= off + len));
    }

    #[test]
    fn chunking_degenerate_sizes() {
        assert!(chunk_spans(3, 4, 32).is_empty());
        assert_eq!(chunk_spans(4, 4, 32), vec![(0, 4)]);
        // A pattern longer than the chunk cap widens the chunk instead of
        // shrinking the step to nothing.
        assert_eq!(chunk_spans(100, 40, 32), vec![(0, 80), (41, 59)]);
    }
}
