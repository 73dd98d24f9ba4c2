use crate::bitfield::{Cell, Prop};

pub(crate) const MESSAGE_ID_LEN: usize = 2;

const ACTION: Prop = Prop::new("action", &[Cell::masked(0, 0xF8, 3)]);
const PART: Prop = Prop::new(
    "part",
    &[Cell::masked(0, 0x07, -3), Cell::masked(1, 0xE0, 5)],
);
const INDEX: Prop = Prop::new("index", &[Cell::masked(1, 0x1F, 0)]);

/// Two-byte reference to a dialogue message plus the action run after it.
///
/// Layout: `aaaaappp pppiiiii` (action, part, index).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct MessageId {
    bytes: [u8; MESSAGE_ID_LEN],
}

impl MessageId {
    pub fn new(action: u8, part: u8, index: u8) -> Self {
        let mut id = MessageId::default();
        id.set_action(action);
        id.set_part(part);
        id.set_index(index);
        id
    }

    pub fn from_word(word: u16) -> Self {
        MessageId {
            bytes: word.to_be_bytes(),
        }
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        MessageId { bytes }
    }

    pub fn word(&self) -> u16 {
        u16::from_be_bytes(self.bytes)
    }

    pub fn bytes(&self) -> [u8; MESSAGE_ID_LEN] {
        self.bytes
    }

    pub fn action(&self) -> u8 {
        ACTION.get(&self.bytes) as u8
    }

    pub fn set_action(&mut self, action: u8) {
        ACTION.set(&mut self.bytes, action as u32);
    }

    pub fn part(&self) -> u8 {
        PART.get(&self.bytes) as u8
    }

    pub fn set_part(&mut self, part: u8) {
        PART.set(&mut self.bytes, part as u32);
    }

    pub fn index(&self) -> u8 {
        INDEX.get(&self.bytes) as u8
    }

    pub fn set_index(&mut self, index: u8) {
        INDEX.set(&mut self.bytes, index as u32);
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}", self.part(), self.index())?;
        if self.action() != 0 {
            write!(f, " action={:02x}", self.action())?;
        }
        Ok(())
    }
}
