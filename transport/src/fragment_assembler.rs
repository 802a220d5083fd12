use std::sync::{Arc, Mutex};
use bytes::{BufMut, BytesMut};
use tokio::time::Instant;
use crate::buffer_pool::BufferPool;

struct AssemblerSlots {
    slots: Vec<Option<BytesMut>>,
    received_count: usize,
    received_bytes: usize,
}

/// Collects the fragments of a single inbound message until all of them are present.
///
/// The slot buffers come from a [BufferPool] and go back to it when the assembler is dropped,
///  regardless of whether the message was completed.
pub struct FragmentAssembler {
    fragment_count: u16,
    created_at: Instant,
    buffer_pool: Arc<BufferPool>,
    inner: Mutex<AssemblerSlots>,
}

impl FragmentAssembler {
    pub fn new(fragment_count: u16, buffer_pool: Arc<BufferPool>) -> FragmentAssembler {
        FragmentAssembler {
            fragment_count,
            created_at: Instant::now(),
            buffer_pool,
            inner: Mutex::new(AssemblerSlots {
                slots: (0..fragment_count).map(|_| None).collect(),
                received_count: 0,
                received_bytes: 0,
            }),
        }
    }

    pub fn fragment_count(&self) -> u16 {
        self.fragment_count
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Stores a fragment's payload. Returns true iff this call completed the message, so
    ///  exactly one caller observes completion. Out-of-range indexes and fragments that
    ///  were already received are ignored and return false.
    pub fn add_fragment(&self, fragment_index: u16, payload: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let slot = match inner.slots.get_mut(fragment_index as usize) {
            Some(slot) if slot.is_none() => slot,
            _ => return false,
        };

        let mut buf = self.buffer_pool.get_from_pool();
        buf.put_slice(payload);
        *slot = Some(buf);

        inner.received_count += 1;
        inner.received_bytes += payload.len();
        inner.received_count == self.fragment_count as usize
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().received_count == self.fragment_count as usize
    }

    /// The combined length of all received fragments - this is the message length only after
    ///  [FragmentAssembler::add_fragment] returned true
    pub fn merged_size(&self) -> usize {
        self.inner.lock().unwrap().received_bytes
    }

    /// Writes all received fragments in index order. Missing fragments are skipped, so the
    ///  result is only meaningful for a completed message.
    pub fn copy_merged(&self, target: &mut impl BufMut) {
        let inner = self.inner.lock().unwrap();
        for buf in inner.slots.iter().flatten() {
            target.put_slice(buf);
        }
    }

    pub fn merged(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.merged_size());
        self.copy_merged(&mut result);
        result
    }
}

impl Drop for FragmentAssembler {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            for buf in inner.slots.drain(..).flatten() {
                self.buffer_pool.return_to_pool(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::thread;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(4, 100))
    }

    #[rstest]
    #[case::single(1, vec![(0, vec![1,2,3])], vec![true], vec![1,2,3])]
    #[case::empty_payload(1, vec![(0, vec![])], vec![true], vec![])]
    #[case::in_order(3, vec![(0, vec![1,2]), (1, vec![3,4]), (2, vec![5])], vec![false, false, true], vec![1,2,3,4,5])]
    #[case::reverse(3, vec![(2, vec![5]), (1, vec![3,4]), (0, vec![1,2])], vec![false, false, true], vec![1,2,3,4,5])]
    #[case::shuffled(3, vec![(1, vec![3,4]), (2, vec![5]), (0, vec![1,2])], vec![false, false, true], vec![1,2,3,4,5])]
    #[case::duplicate_ignored(2, vec![(0, vec![1,2]), (0, vec![9,9]), (1, vec![3])], vec![false, false, true], vec![1,2,3])]
    #[case::duplicate_after_completion(2, vec![(0, vec![1,2]), (1, vec![3]), (1, vec![9])], vec![false, true, false], vec![1,2,3])]
    #[case::out_of_range(2, vec![(0, vec![1,2]), (2, vec![7]), (1, vec![3])], vec![false, false, true], vec![1,2,3])]
    #[case::far_out_of_range(1, vec![(u16::MAX, vec![7]), (0, vec![3])], vec![false, true], vec![3])]
    fn test_add_fragment(#[case] fragment_count: u16, #[case] fragments: Vec<(u16, Vec<u8>)>, #[case] expected_results: Vec<bool>, #[case] expected_merged: Vec<u8>) {
        let assembler = FragmentAssembler::new(fragment_count, pool());

        let results = fragments.iter()
            .map(|(idx, payload)| assembler.add_fragment(*idx, payload))
            .collect::<Vec<_>>();
        assert_eq!(results, expected_results);

        assert!(assembler.is_complete());
        assert_eq!(assembler.merged_size(), expected_merged.len());
        assert_eq!(assembler.merged(), expected_merged);
    }

    #[test]
    fn test_incomplete() {
        let assembler = FragmentAssembler::new(3, pool());
        assert!(!assembler.add_fragment(0, &[1]));
        assert!(!assembler.add_fragment(2, &[3]));
        assert!(!assembler.is_complete());
        assert_eq!(assembler.merged_size(), 2);
    }

    #[test]
    fn test_copy_merged_into_slice() {
        let assembler = FragmentAssembler::new(2, pool());
        assembler.add_fragment(1, &[3, 4]);
        assembler.add_fragment(0, &[1, 2]);

        let mut target = vec![0u8; assembler.merged_size()];
        assembler.copy_merged(&mut target.as_mut_slice());
        assert_eq!(target, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_drop_returns_buffers() {
        let pool = pool();
        {
            let assembler = FragmentAssembler::new(3, pool.clone());
            assembler.add_fragment(0, &[1, 2, 3, 4]);
            assembler.add_fragment(2, &[1]);
        }
        assert_eq!(pool.num_pooled(), 2);
    }

    #[test]
    fn test_concurrent_completion_observed_once() {
        let fragment_count = 64u16;
        let assembler = Arc::new(FragmentAssembler::new(fragment_count, pool()));

        let handles = (0..4)
            .map(|_| {
                let assembler = assembler.clone();
                thread::spawn(move || {
                    (0..fragment_count)
                        .filter(|&idx| assembler.add_fragment(idx, &[idx as u8]))
                        .count()
                })
            })
            .collect::<Vec<_>>();

        let completions: usize = handles.into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert_eq!(completions, 1);
        assert_eq!(assembler.merged(), (0..fragment_count).map(|i| i as u8).collect::<Vec<_>>());
    }
}
