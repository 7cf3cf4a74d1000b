//! Event codec.
//!
//! An event is three 64-bit header words followed by the waveform payload:
//!
//! ```text
//! word 0: format (8) | event_counter (24) | size_64bit_words (32)
//! word 1: flags (12) | overlap (4)        | trigger_time (48)
//! word 2: channel_enable_mask (64)
//! ```
//!
//! The payload is a sequence of 4-sample quads. Within each quad there is one
//! 64-bit word per enabled channel, in ascending channel order; sample `k` of
//! the quad sits in bits `16k..16k+16` of that word.
//!
//! Boards send words in network order. Everything the front end stores in its
//! ring buffers or hands to the event sink is in host order, which here means
//! the canonical little-endian layout.

use crate::error::CodecError;
use ndarray::Array2;

pub const HEADER_WORDS: usize = 3;
pub const HEADER_BYTES: usize = HEADER_WORDS * 8;
pub const FORMAT_WAVEFORM: u8 = 0x10;
pub const NUM_CHANNELS: usize = 64;
pub const SAMPLES_PER_QUAD: usize = 4;

pub const EVENT_COUNTER_MASK: u32 = 0xFF_FFFF;
const TRIGGER_TIME_MASK: u64 = 0xFFFF_FFFF_FFFF;
const FLAGS_MASK: u16 = 0xFFF;
const OVERLAP_MASK: u8 = 0xF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    /// Canonical layout used inside the front end.
    Host,
    /// Layout sent by the boards.
    Network,
}

impl ByteOrder {
    fn read(self, bytes: [u8; 8]) -> u64 {
        match self {
            Self::Host => u64::from_le_bytes(bytes),
            Self::Network => u64::from_be_bytes(bytes),
        }
    }

    fn write(self, word: u64) -> [u8; 8] {
        match self {
            Self::Host => word.to_le_bytes(),
            Self::Network => word.to_be_bytes(),
        }
    }
}

/// Read the `index`th 64-bit word of `buf`. The caller bounds-checks.
fn word_at(buf: &[u8], index: usize, order: ByteOrder) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[index * 8..index * 8 + 8]);
    order.read(bytes)
}

fn put_word(out: &mut [u8], index: usize, word: u64, order: ByteOrder) {
    out[index * 8..index * 8 + 8].copy_from_slice(&order.write(word));
}

/// Convert every whole 64-bit word of `buf` from network to host order.
pub fn network_to_host(buf: &mut [u8]) {
    for word in buf.chunks_exact_mut(8) {
        word.reverse();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventHeader {
    pub format: u8,
    pub event_counter: u32,
    pub size_64bit_words: u32,
    pub flags: u16,
    pub overlap: u8,
    pub trigger_time: u64,
    pub ch_enable_mask: u64,
}

impl EventHeader {
    /// Decode the first 24 bytes of `buf`.
    ///
    /// The declared size is not checked against `buf`; callers must compare
    /// [`EventHeader::size_bytes`] with what they actually hold before
    /// touching the payload.
    pub fn decode(buf: &[u8], order: ByteOrder) -> Result<Self, CodecError> {
        if buf.len() < HEADER_BYTES {
            return Err(CodecError::Truncated {
                needed: HEADER_BYTES,
                available: buf.len(),
            });
        }

        Ok(Self::from_words([
            word_at(buf, 0, order),
            word_at(buf, 1, order),
            word_at(buf, 2, order),
        ]))
    }

    pub fn from_words(words: [u64; 3]) -> Self {
        Self {
            format: (words[0] >> 56) as u8,
            event_counter: ((words[0] >> 32) as u32) & EVENT_COUNTER_MASK,
            size_64bit_words: words[0] as u32,
            flags: ((words[1] >> 52) as u16) & FLAGS_MASK,
            overlap: ((words[1] >> 48) as u8) & OVERLAP_MASK,
            trigger_time: words[1] & TRIGGER_TIME_MASK,
            ch_enable_mask: words[2],
        }
    }

    pub fn to_words(&self) -> [u64; 3] {
        [
            ((self.format as u64) << 56)
                | (((self.event_counter & EVENT_COUNTER_MASK) as u64) << 32)
                | self.size_64bit_words as u64,
            (((self.flags & FLAGS_MASK) as u64) << 52)
                | (((self.overlap & OVERLAP_MASK) as u64) << 48)
                | (self.trigger_time & TRIGGER_TIME_MASK),
            self.ch_enable_mask,
        ]
    }

    /// Write the three header words to the start of `out`.
    pub fn encode(&self, out: &mut [u8], order: ByteOrder) -> Result<usize, CodecError> {
        if out.len() < HEADER_BYTES {
            return Err(CodecError::OutputTooSmall {
                needed: HEADER_BYTES,
                available: out.len(),
            });
        }

        for (i, word) in self.to_words().into_iter().enumerate() {
            put_word(out, i, word, order);
        }

        Ok(HEADER_BYTES)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_64bit_words as u64 * 8
    }

    pub fn is_waveform(&self) -> bool {
        self.format == FORMAT_WAVEFORM
    }

    pub fn num_channels(&self) -> u32 {
        self.ch_enable_mask.count_ones()
    }

    pub fn channel_enabled(&self, channel: usize) -> bool {
        channel < NUM_CHANNELS && self.ch_enable_mask & (1u64 << channel) != 0
    }

    pub fn samples_per_channel(&self) -> u64 {
        let n_chan = self.num_channels() as u64;
        if n_chan == 0 {
            return 0;
        }
        let payload_words = (self.size_64bit_words as u64).saturating_sub(HEADER_WORDS as u64);
        payload_words * SAMPLES_PER_QUAD as u64 / n_chan
    }
}

/// A decoded event borrowing its bytes.
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    pub header: EventHeader,
    bytes: &'a [u8],
    order: ByteOrder,
}

/// Decode the event at the start of `buf` without copying.
///
/// Fails if the declared size is below the header size or beyond `buf`.
pub fn decode_event(buf: &[u8], order: ByteOrder) -> Result<Event<'_>, CodecError> {
    let header = EventHeader::decode(buf, order)?;

    if (header.size_64bit_words as usize) < HEADER_WORDS {
        return Err(CodecError::BadSize {
            words: header.size_64bit_words,
        });
    }

    let size = header.size_bytes();
    if size > buf.len() as u64 {
        return Err(CodecError::Truncated {
            needed: size as usize,
            available: buf.len(),
        });
    }

    Ok(Event {
        header,
        bytes: &buf[..size as usize],
        order,
    })
}

impl<'a> Event<'a> {
    /// Index of the first payload word.
    pub fn wf_begin(&self) -> usize {
        HEADER_WORDS
    }

    /// One past the last payload word.
    pub fn wf_end(&self) -> usize {
        self.header.size_64bit_words as usize
    }

    pub fn payload_words(&self) -> usize {
        self.wf_end() - self.wf_begin()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// The `i`th payload word in host layout.
    pub fn payload_word(&self, i: usize) -> u64 {
        word_at(self.bytes, self.wf_begin() + i, self.order)
    }

    /// Position of `channel` within a quad, or `None` if it is not enabled.
    fn channel_slot(&self, channel: usize) -> Option<usize> {
        if !self.header.channel_enabled(channel) {
            return None;
        }
        let below = self.header.ch_enable_mask & ((1u64 << channel) - 1);
        Some(below.count_ones() as usize)
    }

    fn channel_word_indices(&self, channel: usize) -> impl Iterator<Item = usize> {
        let n_chan = self.header.num_channels() as usize;
        let payload_words = self.payload_words();
        self.channel_slot(channel)
            .into_iter()
            .flat_map(move |slot| (slot..payload_words).step_by(n_chan.max(1)))
    }

    /// Copy up to `out.len()` samples of `channel` into `out`.
    ///
    /// Returns 0 if the channel is not enabled. A short `out` is filled and
    /// the rest of the waveform is ignored.
    pub fn extract_channel_samples(&self, channel: usize, out: &mut [u16]) -> usize {
        let mut written = 0;

        for index in self.channel_word_indices(channel) {
            if written == out.len() {
                break;
            }
            let word = self.payload_word(index);
            for k in 0..SAMPLES_PER_QUAD {
                if written == out.len() {
                    break;
                }
                out[written] = (word >> (16 * k)) as u16;
                written += 1;
            }
        }

        written
    }

    /// Every payload word of `channel`, one per quad.
    pub fn extract_channel_words(&self, channel: usize) -> Vec<u64> {
        self.channel_word_indices(channel)
            .map(|index| self.payload_word(index))
            .collect()
    }

    pub fn channel_samples(&self, channel: usize) -> Vec<u16> {
        let mut samples = vec![0u16; self.header.samples_per_channel() as usize];
        let n = self.extract_channel_samples(channel, &mut samples);
        samples.truncate(n);
        samples
    }

    /// Enabled channels as rows of a (channels x samples) array.
    pub fn waveforms(&self) -> Array2<u16> {
        let n_chan = self.header.num_channels() as usize;
        let n_samples = self.header.samples_per_channel() as usize;
        let mut waveforms = Array2::<u16>::zeros((n_chan, n_samples));

        let enabled = (0..NUM_CHANNELS).filter(|&c| self.header.channel_enabled(c));
        for (row, channel) in enabled.enumerate() {
            let samples = self.channel_samples(channel);
            for (col, sample) in samples.into_iter().enumerate().take(n_samples) {
                waveforms[[row, col]] = sample;
            }
        }

        waveforms
    }

    /// Write this event to `out` in host order: header then payload words.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, CodecError> {
        let size = self.bytes.len();
        if out.len() < size {
            return Err(CodecError::OutputTooSmall {
                needed: size,
                available: out.len(),
            });
        }

        self.header.encode(out, ByteOrder::Host)?;
        match self.order {
            ByteOrder::Host => out[HEADER_BYTES..size].copy_from_slice(&self.bytes[HEADER_BYTES..]),
            ByteOrder::Network => {
                for i in 0..self.payload_words() {
                    put_word(out, HEADER_WORDS + i, self.payload_word(i), ByteOrder::Host);
                }
            }
        }

        Ok(size)
    }
}

/// Pack four samples into one payload word.
pub fn pack_quad(samples: [u16; 4]) -> u64 {
    samples
        .iter()
        .enumerate()
        .fold(0u64, |word, (k, &s)| word | ((s as u64) << (16 * k)))
}

/// Build a waveform event from per-channel samples, one row of `waveforms`
/// per enabled channel in ascending channel order. Samples past the last
/// whole quad are dropped. Returns the header that was written.
pub fn pack_waveform_event(
    event_counter: u32,
    trigger_time: u64,
    flags: u16,
    channel_mask: u64,
    waveforms: &Array2<u16>,
    order: ByteOrder,
    out: &mut Vec<u8>,
) -> EventHeader {
    let n_chan = channel_mask.count_ones() as usize;
    let quads = if n_chan == 0 {
        0
    } else {
        waveforms.ncols() / SAMPLES_PER_QUAD
    };
    let rows = waveforms.nrows().min(n_chan);

    let header = EventHeader {
        format: FORMAT_WAVEFORM,
        event_counter: event_counter & EVENT_COUNTER_MASK,
        size_64bit_words: (HEADER_WORDS + n_chan * quads) as u32,
        flags,
        overlap: 0,
        trigger_time,
        ch_enable_mask: channel_mask,
    };

    out.clear();
    for word in header.to_words() {
        out.extend_from_slice(&order.write(word));
    }
    for q in 0..quads {
        for row in 0..n_chan {
            let mut quad = [0u16; 4];
            if row < rows {
                for (k, sample) in quad.iter_mut().enumerate() {
                    *sample = waveforms[[row, q * SAMPLES_PER_QUAD + k]];
                }
            }
            out.extend_from_slice(&order.write(pack_quad(quad)));
        }
    }

    header
}

/// Re-frame one event from the decoded scope endpoint into the wire layout.
///
/// `waveforms` has one row per board channel (row index == channel number).
/// Each 16-bit sample pair is byte-swapped as a 32-bit unit, which is the
/// packing downstream readers of the legacy format expect.
pub fn encode_scope_event(
    channel_mask: u64,
    wf_len_samples: usize,
    timestamp: u64,
    event_counter: u32,
    flags: u16,
    waveforms: &Array2<u16>,
    out: &mut [u8],
) -> Result<usize, CodecError> {
    let channels: Vec<usize> = (0..NUM_CHANNELS)
        .filter(|&c| channel_mask & (1u64 << c) != 0)
        .collect();
    let quads = wf_len_samples / SAMPLES_PER_QUAD;
    let size_words = HEADER_WORDS + channels.len() * quads;
    let size_bytes = size_words * 8;

    if out.len() < size_bytes {
        return Err(CodecError::OutputTooSmall {
            needed: size_bytes,
            available: out.len(),
        });
    }
    for &c in &channels {
        let available = if c < waveforms.nrows() { waveforms.ncols() } else { 0 };
        if available < quads * SAMPLES_PER_QUAD {
            return Err(CodecError::ShortWaveform {
                channel: c,
                needed: quads * SAMPLES_PER_QUAD,
                available,
            });
        }
    }

    let header = EventHeader {
        format: FORMAT_WAVEFORM,
        event_counter: event_counter & EVENT_COUNTER_MASK,
        size_64bit_words: size_words as u32,
        flags,
        overlap: 0,
        trigger_time: timestamp,
        ch_enable_mask: channel_mask,
    };
    header.encode(out, ByteOrder::Host)?;

    let mut index = HEADER_WORDS;
    for q in 0..quads {
        let s = q * SAMPLES_PER_QUAD;
        for &c in &channels {
            let w = |k: usize| waveforms[[c, s + k]] as u32;
            let samp_dc = ((w(3) << 16) | w(2)).swap_bytes() as u64;
            let samp_ba = ((w(1) << 16) | w(0)).swap_bytes() as u64;
            put_word(out, index, (samp_dc << 32) | samp_ba, ByteOrder::Host);
            index += 1;
        }
    }

    Ok(size_bytes)
}

/// Frame one decoded user-mode hit as a single-channel event.
///
/// The open firmware does not number its hits, so the caller supplies the
/// counter. The payload is the waveform's whole quads, copied as-is.
pub fn encode_user_event(
    channel_id: u8,
    event_counter: u32,
    timestamp: u64,
    waveform: &[u16],
    out: &mut [u8],
) -> Result<usize, CodecError> {
    let quads = waveform.len() / SAMPLES_PER_QUAD;
    let size_words = HEADER_WORDS + quads;
    let size_bytes = size_words * 8;

    if out.len() < size_bytes {
        return Err(CodecError::OutputTooSmall {
            needed: size_bytes,
            available: out.len(),
        });
    }

    let header = EventHeader {
        format: FORMAT_WAVEFORM,
        event_counter: event_counter & EVENT_COUNTER_MASK,
        size_64bit_words: size_words as u32,
        flags: 0,
        overlap: 0,
        trigger_time: timestamp,
        ch_enable_mask: 1u64 << (channel_id as usize % NUM_CHANNELS),
    };
    header.encode(out, ByteOrder::Host)?;

    let payload = &mut out[HEADER_BYTES..size_bytes];
    for (bytes, sample) in payload
        .chunks_exact_mut(2)
        .zip(&waveform[..quads * SAMPLES_PER_QUAD])
    {
        bytes.copy_from_slice(&sample.to_le_bytes());
    }

    Ok(size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn boundary_header() -> EventHeader {
        EventHeader {
            format: 0xFF,
            event_counter: 0xFF_FFFF,
            size_64bit_words: u32::MAX,
            flags: 0xFFF,
            overlap: 0xF,
            trigger_time: 0xFFFF_FFFF_FFFF,
            ch_enable_mask: u64::MAX,
        }
    }

    #[test]
    fn header_round_trip_at_field_limits() {
        let headers = [
            boundary_header(),
            EventHeader::default(),
            EventHeader {
                format: FORMAT_WAVEFORM,
                event_counter: 0x80_0001,
                size_64bit_words: 3,
                flags: 0x801,
                overlap: 0x8,
                trigger_time: 0x8000_0000_0001,
                ch_enable_mask: 0x8000_0000_0000_0001,
            },
        ];

        for order in [ByteOrder::Host, ByteOrder::Network] {
            for h in headers {
                let mut buf = [0u8; HEADER_BYTES];
                h.encode(&mut buf, order).unwrap();
                assert_eq!(EventHeader::decode(&buf, order).unwrap(), h);
            }
        }
    }

    #[test]
    fn fields_do_not_bleed_into_each_other() {
        let mut h = EventHeader::default();
        h.event_counter = 0xFF_FFFF;
        let words = h.to_words();
        assert_eq!(words[0], 0x00FF_FFFF_0000_0000);

        h = EventHeader::default();
        h.overlap = 0xF;
        assert_eq!(h.to_words()[1], 0x000F_0000_0000_0000);
    }

    #[test]
    fn network_order_header_matches_board_layout() {
        // format 0x10, counter 0x000102, size 5 words, as the board sends them
        let mut buf = vec![0x10, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x05];
        buf.extend_from_slice(&[0u8; 16]);
        let h = EventHeader::decode(&buf, ByteOrder::Network).unwrap();
        assert_eq!(h.format, 0x10);
        assert_eq!(h.event_counter, 0x102);
        assert_eq!(h.size_64bit_words, 5);
    }

    #[test]
    fn short_header_is_rejected() {
        let err = EventHeader::decode(&[0u8; 23], ByteOrder::Host).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: 24,
                available: 23
            }
        );
    }

    fn two_channel_event(order: ByteOrder) -> Vec<u8> {
        // channels 0 and 2, eight samples each
        let waveforms = array![
            [1u16, 2, 3, 4, 5, 6, 7, 8],
            [101u16, 102, 103, 104, 105, 106, 107, 108]
        ];
        let mut buf = Vec::new();
        pack_waveform_event(9, 1234, 0, 0b101, &waveforms, order, &mut buf);
        buf
    }

    #[test]
    fn size_invariant_holds() {
        let buf = two_channel_event(ByteOrder::Host);
        let ev = decode_event(&buf, ByteOrder::Host).unwrap();
        assert_eq!(ev.header.size_bytes(), 8 * ev.header.size_64bit_words as u64);
        assert_eq!(
            ev.wf_end() - ev.wf_begin(),
            ev.header.size_64bit_words as usize - 3
        );
        assert_eq!(ev.header.samples_per_channel(), 8);
        assert_eq!(ev.as_bytes().len(), buf.len());
    }

    #[test]
    fn extracts_interleaved_channels() {
        for order in [ByteOrder::Host, ByteOrder::Network] {
            let buf = two_channel_event(order);
            let ev = decode_event(&buf, order).unwrap();
            let mut out = [0u16; 16];

            assert_eq!(ev.extract_channel_samples(0, &mut out), 8);
            assert_eq!(&out[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);

            assert_eq!(ev.extract_channel_samples(2, &mut out), 8);
            assert_eq!(&out[..8], &[101, 102, 103, 104, 105, 106, 107, 108]);

            assert_eq!(ev.extract_channel_samples(1, &mut out), 0);
        }
    }

    #[test]
    fn partial_fill_stops_at_capacity() {
        let buf = two_channel_event(ByteOrder::Host);
        let ev = decode_event(&buf, ByteOrder::Host).unwrap();
        let mut out = [0u16; 5];
        assert_eq!(ev.extract_channel_samples(2, &mut out), 5);
        assert_eq!(out, [101, 102, 103, 104, 105]);
    }

    #[test]
    fn channel_words_and_waveform_matrix() {
        let buf = two_channel_event(ByteOrder::Host);
        let ev = decode_event(&buf, ByteOrder::Host).unwrap();
        assert_eq!(
            ev.extract_channel_words(0),
            vec![pack_quad([1, 2, 3, 4]), pack_quad([5, 6, 7, 8])]
        );
        assert!(ev.extract_channel_words(63).is_empty());

        let wf = ev.waveforms();
        assert_eq!(wf.dim(), (2, 8));
        assert_eq!(wf[[1, 7]], 108);
    }

    #[test]
    fn reencoding_network_event_gives_host_layout() {
        let net = two_channel_event(ByteOrder::Network);
        let host = two_channel_event(ByteOrder::Host);
        let ev = decode_event(&net, ByteOrder::Network).unwrap();
        let mut out = vec![0u8; net.len()];
        assert_eq!(ev.encode(&mut out).unwrap(), net.len());
        assert_eq!(out, host);

        let mut converted = net.clone();
        network_to_host(&mut converted);
        assert_eq!(converted, host);
    }

    #[test]
    fn event_larger_than_buffer_is_rejected() {
        let buf = two_channel_event(ByteOrder::Host);
        let err = decode_event(&buf[..buf.len() - 8], ByteOrder::Host).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn scope_encoding_swaps_sample_pairs() {
        let mut waveforms = Array2::<u16>::zeros((NUM_CHANNELS, 4));
        for (k, s) in [0x0102u16, 0x0304, 0x0506, 0x0708].iter().enumerate() {
            waveforms[[3, k]] = *s;
        }
        let mut out = [0u8; 64];
        let n = encode_scope_event(1 << 3, 4, 77, 5, 0x12, &waveforms, &mut out).unwrap();
        assert_eq!(n, 32);

        let ev = decode_event(&out, ByteOrder::Host).unwrap();
        assert_eq!(ev.header.event_counter, 5);
        assert_eq!(ev.header.flags, 0x12);
        assert_eq!(ev.header.trigger_time, 77);
        assert_eq!(ev.header.overlap, 0);

        let samp_ba = 0x0304_0102u32.swap_bytes() as u64;
        let samp_dc = 0x0708_0506u32.swap_bytes() as u64;
        assert_eq!(ev.payload_word(0), (samp_dc << 32) | samp_ba);
    }

    #[test]
    fn scope_encoding_checks_output_size() {
        let waveforms = Array2::<u16>::zeros((NUM_CHANNELS, 8));
        let mut out = [0u8; 40];
        let err = encode_scope_event(0b11, 8, 0, 0, 0, &waveforms, &mut out).unwrap_err();
        assert_eq!(
            err,
            CodecError::OutputTooSmall {
                needed: 56,
                available: 40
            }
        );
    }

    #[test]
    fn user_event_is_single_channel() {
        let waveform: Vec<u16> = (0..10).collect();
        let mut out = [0u8; 128];
        let n = encode_user_event(7, 42, 999, &waveform, &mut out).unwrap();
        assert_eq!(n, 24 + 2 * 8);

        let ev = decode_event(&out, ByteOrder::Host).unwrap();
        assert_eq!(ev.header.ch_enable_mask, 1 << 7);
        assert_eq!(ev.header.event_counter, 42);
        assert_eq!(ev.header.flags, 0);
        assert_eq!(ev.channel_samples(7), (0..8).collect::<Vec<u16>>());
    }
}
