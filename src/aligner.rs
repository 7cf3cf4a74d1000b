use crate::event::{EventHeader, ByteOrder, EVENT_COUNTER_MASK, HEADER_BYTES};
use crate::ring_buffer::RingBuffer;
use log::{debug, error};
use std::collections::BTreeSet;

/// What sits at the read cursor of one ring buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Peek {
    Empty,
    /// Header or payload still arriving.
    Partial,
    Complete { header: EventHeader, size_bytes: usize },
    /// The header declares an impossible size.
    Corrupt { size_bytes: u64 },
}

pub fn peek_event(ring: &mut RingBuffer) -> Peek {
    let capacity = ring.capacity() as u64;
    let buf = ring.readable();
    if buf.is_empty() {
        return Peek::Empty;
    }

    let Ok(header) = EventHeader::decode(buf, ByteOrder::Host) else {
        return Peek::Partial;
    };
    let size_bytes = header.size_bytes();
    if size_bytes > capacity || size_bytes < HEADER_BYTES as u64 {
        return Peek::Corrupt { size_bytes };
    }
    if size_bytes > buf.len() as u64 {
        return Peek::Partial;
    }
    Peek::Complete {
        header,
        size_bytes: size_bytes as usize,
    }
}

/// Boards to take one event from, and the event counter they share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyEvent {
    pub event_counter: u32,
    pub boards: Vec<usize>,
    /// Boards left out in merge mode because they are ahead of
    /// `event_counter`.
    pub missed: Vec<usize>,
}

/// Decides when a logical event can be emitted from the per-board rings.
///
/// In merge mode every reading board must hold a complete event; the lowest
/// event counter wins and boards that are ahead keep their event for a
/// later round. Otherwise the first board with a complete event wins.
#[derive(Debug, Default)]
pub struct EventAligner {
    merge: bool,
    corrupted: BTreeSet<usize>,
    stop_requested: bool,
}

impl EventAligner {
    pub fn new(merge: bool) -> Self {
        Self {
            merge,
            ..Default::default()
        }
    }

    pub fn is_merge(&self) -> bool {
        self.merge
    }

    /// Forget corruption flags at begin-of-run.
    pub fn reset(&mut self, merge: bool) {
        self.merge = merge;
        self.corrupted.clear();
        self.stop_requested = false;
    }

    /// Whether a corrupt header asked for the run to be stopped.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn is_corrupted(&self, board_id: usize) -> bool {
        self.corrupted.contains(&board_id)
    }

    /// `rings[i]` is the ring of board `i`; `boards` are the ones that
    /// supply data, in the order they are tried.
    pub fn is_event_ready(
        &mut self,
        rings: &mut [RingBuffer],
        boards: &[usize],
        names: &[String],
    ) -> Option<ReadyEvent> {
        if self.merge {
            self.merged(rings, boards, names)
        } else {
            self.first_available(rings, boards, names)
        }
    }

    /// Counter of the complete event at the front of a board's ring.
    fn peek_counter(&mut self, rings: &mut [RingBuffer], board_id: usize, names: &[String]) -> Option<u32> {
        if self.corrupted.contains(&board_id) {
            return None;
        }
        let ring = rings.get_mut(board_id)?;
        match peek_event(ring) {
            Peek::Complete { header, .. } => Some(header.event_counter),
            Peek::Corrupt { size_bytes } => {
                self.flag_corruption(board_id, names, size_bytes);
                None
            }
            Peek::Partial => {
                debug!("{}: event still arriving ({} bytes buffered)", board_name(names, board_id), ring.level());
                None
            }
            Peek::Empty => None,
        }
    }

    fn flag_corruption(&mut self, board_id: usize, names: &[String], size_bytes: u64) {
        if self.corrupted.insert(board_id) {
            error!(
                "Data corruption or event size too large; {} reports an event of {size_bytes} bytes",
                board_name(names, board_id)
            );
            self.stop_requested = true;
        }
    }

    fn first_available(
        &mut self,
        rings: &mut [RingBuffer],
        boards: &[usize],
        names: &[String],
    ) -> Option<ReadyEvent> {
        boards.iter().find_map(|&board_id| {
            self.peek_counter(rings, board_id, names)
                .map(|event_counter| ReadyEvent {
                    event_counter,
                    boards: vec![board_id],
                    missed: Vec::new(),
                })
        })
    }

    fn merged(
        &mut self,
        rings: &mut [RingBuffer],
        boards: &[usize],
        names: &[String],
    ) -> Option<ReadyEvent> {
        if boards.is_empty() {
            return None;
        }

        let mut counters = Vec::with_capacity(boards.len());
        for &board_id in boards {
            counters.push((board_id, self.peek_counter(rings, board_id, names)?));
        }

        let reference = counters.first()?.1;
        let lowest = counters
            .iter()
            .map(|&(_, c)| c)
            .min_by_key(|&c| counter_offset(reference, c))?;
        let (included, ahead): (Vec<_>, Vec<_>) = counters.iter().partition(|&&(_, c)| c == lowest);

        let missed: Vec<usize> = ahead.iter().map(|&&(board_id, _)| board_id).collect();
        for &board_id in &missed {
            error!("Board {} missed trigger #{lowest}", board_name(names, board_id));
        }

        Some(ReadyEvent {
            event_counter: lowest,
            boards: included.iter().map(|&&(board_id, _)| board_id).collect(),
            missed,
        })
    }
}

/// Signed distance from `reference` to `counter` on the 24-bit counter
/// circle, so 0x000000 is one past 0xFFFFFF.
fn counter_offset(reference: u32, counter: u32) -> i32 {
    let half = (EVENT_COUNTER_MASK + 1) / 2;
    let diff = counter.wrapping_sub(reference) & EVENT_COUNTER_MASK;
    if diff >= half {
        diff as i32 - (EVENT_COUNTER_MASK + 1) as i32
    } else {
        diff as i32
    }
}

fn board_name(names: &[String], board_id: usize) -> String {
    names
        .get(board_id)
        .cloned()
        .unwrap_or_else(|| format!("board {board_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FORMAT_WAVEFORM;
    use ndarray::Array2;

    fn event_bytes(counter: u32) -> Vec<u8> {
        let mut out = Vec::new();
        crate::event::pack_waveform_event(
            counter,
            1000 + u64::from(counter),
            0,
            0b1,
            &Array2::from_elem((1, 8), 7u16),
            ByteOrder::Host,
            &mut out,
        );
        out
    }

    fn rings_with(counters: &[&[u32]]) -> Vec<RingBuffer> {
        counters
            .iter()
            .map(|events| {
                let rb = RingBuffer::new(4096);
                let mut p = rb.producer().unwrap();
                for &c in *events {
                    p.write(&event_bytes(c)).unwrap();
                }
                rb
            })
            .collect()
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("vx{i:02}")).collect()
    }

    #[test]
    fn peek_classifies_the_front_of_the_ring() {
        let mut rb = RingBuffer::new(4096);
        assert_eq!(peek_event(&mut rb), Peek::Empty);

        let bytes = event_bytes(3);
        let mut p = rb.producer().unwrap();
        p.write(&bytes[..30]).unwrap();
        assert_eq!(peek_event(&mut rb), Peek::Partial);
        p.write(&bytes[30..]).unwrap();
        match peek_event(&mut rb) {
            Peek::Complete { header, size_bytes } => {
                assert_eq!(header.event_counter, 3);
                assert_eq!(header.format, FORMAT_WAVEFORM);
                assert_eq!(size_bytes, bytes.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn independent_mode_takes_the_first_board_with_data() {
        let mut rings = rings_with(&[&[], &[9], &[4]]);
        let mut aligner = EventAligner::new(false);
        let ready = aligner
            .is_event_ready(&mut rings, &[0, 1, 2], &names(3))
            .unwrap();
        assert_eq!(ready.boards, vec![1]);
        assert_eq!(ready.event_counter, 9);

        let mut empty = rings_with(&[&[], &[]]);
        assert!(aligner.is_event_ready(&mut empty, &[0, 1], &names(2)).is_none());
    }

    #[test]
    fn merge_mode_emits_the_lowest_counter() {
        let mut rings = rings_with(&[&[5], &[5], &[6]]);
        let mut aligner = EventAligner::new(true);
        let ready = aligner
            .is_event_ready(&mut rings, &[0, 1, 2], &names(3))
            .unwrap();
        assert_eq!(ready.event_counter, 5);
        assert_eq!(ready.boards, vec![0, 1]);
        assert_eq!(ready.missed, vec![2]);
    }

    #[test]
    fn merge_mode_orders_counters_across_the_wrap() {
        let mut rings = rings_with(&[&[0x00_0000], &[0xFF_FFFF, 0x00_0000]]);
        let mut aligner = EventAligner::new(true);
        let ready = aligner
            .is_event_ready(&mut rings, &[0, 1], &names(2))
            .unwrap();
        assert_eq!(ready.event_counter, 0xFF_FFFF);
        assert_eq!(ready.boards, vec![1]);
        assert_eq!(ready.missed, vec![0]);

        assert_eq!(counter_offset(0xFF_FFFE, 0x00_0001), 3);
        assert_eq!(counter_offset(0x00_0001, 0xFF_FFFE), -3);
        assert_eq!(counter_offset(7, 7), 0);
    }

    #[test]
    fn merge_mode_waits_for_every_board() {
        let mut rings = rings_with(&[&[5], &[]]);
        let mut aligner = EventAligner::new(true);
        assert!(aligner.is_event_ready(&mut rings, &[0, 1], &names(2)).is_none());
        // a board that does not supply data does not hold things up
        assert!(aligner.is_event_ready(&mut rings, &[0], &names(2)).is_some());
    }

    #[test]
    fn board_ahead_keeps_its_event() {
        let mut rings = rings_with(&[&[5, 6], &[6]]);
        let mut aligner = EventAligner::new(true);
        let boards = [0, 1];

        let first = aligner.is_event_ready(&mut rings, &boards, &names(2)).unwrap();
        assert_eq!((first.event_counter, first.boards.clone()), (5, vec![0]));
        let size = match peek_event(&mut rings[0]) {
            Peek::Complete { size_bytes, .. } => size_bytes,
            other => panic!("unexpected {other:?}"),
        };
        rings[0].consume(size);

        let second = aligner.is_event_ready(&mut rings, &boards, &names(2)).unwrap();
        assert_eq!(second.event_counter, 6);
        assert_eq!(second.boards, vec![0, 1]);
        assert!(second.missed.is_empty());
    }

    #[test]
    fn corruption_is_flagged_once() {
        let mut rings = rings_with(&[&[], &[2]]);
        {
            let mut bad = EventHeader::decode(&event_bytes(1), ByteOrder::Host).unwrap();
            bad.size_64bit_words = 1 << 20;
            let mut bytes = [0u8; HEADER_BYTES];
            bad.encode(&mut bytes, ByteOrder::Host).unwrap();
            let mut p = rings[0].producer().unwrap();
            p.write(&bytes).unwrap();
        }

        let mut aligner = EventAligner::new(false);
        for _ in 0..5 {
            let ready = aligner
                .is_event_ready(&mut rings, &[0, 1], &names(2))
                .unwrap();
            assert_eq!(ready.boards, vec![1]);
        }
        assert!(aligner.is_corrupted(0));
        assert_eq!(aligner.corrupted.len(), 1);
        assert!(aligner.stop_requested());

        aligner.reset(false);
        assert!(!aligner.stop_requested());
    }
}
