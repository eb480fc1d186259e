//! Continuation state for a write the socket could not take in one call.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, Bytes};

use crate::registry::Publication;

/// Bytes still owed to one socket, plus the publications they belong to.
///
/// Every logical packet handed to the socket layer while an earlier one is
/// unfinished is appended here, so a socket never has more than one of
/// these and packets leave in the order they were submitted.
#[derive(Debug, Default)]
pub struct PendingWrite {
    bufs: VecDeque<Bytes>,
    /// Bytes written since this record was created.
    written: usize,
    /// Keeps QoS 0 payloads alive until they have left.
    holds: Vec<Publication>,
}

impl PendingWrite {
    pub fn new(bufs: Vec<Bytes>, hold: Option<Publication>) -> Self {
        let mut pending = Self::default();
        pending.append(bufs, hold);
        pending
    }

    pub fn append(&mut self, bufs: Vec<Bytes>, hold: Option<Publication>) {
        self.bufs.extend(bufs.into_iter().filter(|b| !b.is_empty()));
        self.holds.extend(hold);
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.bufs.iter().map(Bytes::len).sum()
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Slices for the next vectored write, capped at `limit` bytes.
    pub fn io_slices(&self, limit: Option<usize>) -> Vec<IoSlice<'_>> {
        let mut budget = limit.unwrap_or(usize::MAX);
        let mut slices = Vec::with_capacity(self.bufs.len());
        for buf in &self.bufs {
            if budget == 0 {
                break;
            }
            let take = buf.len().min(budget);
            slices.push(IoSlice::new(&buf[..take]));
            budget -= take;
        }
        slices
    }

    /// Drop `n` bytes from the front after a successful write.
    pub fn advance(&mut self, mut n: usize) {
        self.written += n;
        while n > 0 {
            let Some(front) = self.bufs.front_mut() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                self.bufs.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
        if self.bufs.is_empty() {
            self.holds.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_across_buffers() {
        let mut pending = PendingWrite::new(
            vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defg")],
            None,
        );
        assert_eq!(pending.remaining(), 7);

        pending.advance(2);
        let slices = pending.io_slices(None);
        assert_eq!(&*slices[0], b"c");
        assert_eq!(&*slices[1], b"defg");

        pending.advance(3);
        assert_eq!(pending.remaining(), 2);
        assert_eq!(pending.written(), 5);

        pending.advance(2);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_io_slices_limit() {
        let pending = PendingWrite::new(
            vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")],
            None,
        );
        let slices = pending.io_slices(Some(1));
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"a");

        let slices = pending.io_slices(Some(4));
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[1], b"d");
    }

    #[test]
    fn test_holds_released_on_completion() {
        let publication = Publication::new("t", "payload");
        let mut pending = PendingWrite::new(
            vec![Bytes::from_static(b"hdr"), publication.payload().clone()],
            Some(publication.clone()),
        );
        assert_eq!(publication.ref_count(), 2);

        pending.append(vec![Bytes::from_static(b"ack")], None);
        pending.advance(10);
        assert_eq!(publication.ref_count(), 2);
        pending.advance(3);
        assert_eq!(publication.ref_count(), 1);
    }
}
