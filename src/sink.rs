use anyhow::Result;

/// One named block of an event, such as `D000` for the data of board 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bank {
    pub name: String,
    pub data: Vec<u8>,
}

impl Bank {
    pub fn data_bank(board_id: usize, data: Vec<u8>) -> Self {
        Self {
            name: format!("D{board_id:03}"),
            data,
        }
    }

    pub fn metadata_bank(board_id: usize, words: [u32; 4]) -> Self {
        Self {
            name: format!("M{board_id:03}"),
            data: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
        }
    }

    /// Board index encoded in the bank name.
    pub fn board_id(&self) -> Option<usize> {
        self.name.get(1..)?.parse().ok()
    }

    /// The four words of an `M###` bank.
    pub fn metadata_words(&self) -> Option<[u32; 4]> {
        if !self.name.starts_with('M') || self.data.len() != 16 {
            return None;
        }
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(self.data.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(words)
    }
}

/// A finished logical event, ready for the sink.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupEvent {
    pub trigger_mask: u16,
    pub banks: Vec<Bank>,
}

impl GroupEvent {
    pub fn size_bytes(&self) -> usize {
        self.banks.iter().map(|b| b.data.len()).sum()
    }
}

/// Where finished events and periodic metadata go.
pub trait EventSink {
    fn write_event(&mut self, event: &GroupEvent) -> Result<()>;
    fn write_metadata(&mut self, event: &GroupEvent) -> Result<()>;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<GroupEvent>,
    pub metadata: Vec<GroupEvent>,
}

impl EventSink for MemorySink {
    fn write_event(&mut self, event: &GroupEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn write_metadata(&mut self, event: &GroupEvent) -> Result<()> {
        self.metadata.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_names_carry_the_board() {
        let bank = Bank::data_bank(7, vec![1, 2, 3]);
        assert_eq!(bank.name, "D007");
        assert_eq!(bank.board_id(), Some(7));
        assert!(bank.metadata_words().is_none());

        let meta = Bank::metadata_bank(12, [3, 31, 52, 0x10]);
        assert_eq!(meta.name, "M012");
        assert_eq!(meta.metadata_words(), Some([3, 31, 52, 0x10]));
    }

    #[test]
    fn memory_sink_collects() {
        let mut sink = MemorySink::default();
        let event = GroupEvent {
            trigger_mask: 2,
            banks: vec![Bank::data_bank(0, vec![0; 24])],
        };
        sink.write_event(&event).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.events[0].size_bytes(), 24);
        assert!(sink.metadata.is_empty());
    }
}
