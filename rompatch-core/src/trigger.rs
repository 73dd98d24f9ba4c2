use crate::image::read_u16_le;
use crate::message::MessageId;
use crate::record::{self, ConditionalRecord, FlagRef};
use crate::writer::{WriteId, Writer};
use crate::{PatchError, Result};

pub const POINTER_TABLE: u32 = 0x1E17A;
const DATA_BASE: u32 = 0x14000;
const BANK_START: u32 = 0x1E000;
const BANK_END: u32 = 0x20000;

/// Trigger ids with no live record behind their pointer.
const UNUSED_TRIGGERS: &[u8] = &[
    0x87, 0x88, 0x89, 0x8F, 0x93, 0x96, 0x98, 0x9B, 0x9C, 0x9D, 0x9E, 0x9F, 0xA0, 0xB5, 0xB9,
    0xBE, 0xC0,
];

/// A map trigger: flags to check, the message shown, and flags to change.
///
/// Positive flag references must be set (or get set); negated ones must be
/// clear (or get cleared).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Trigger {
    pub id: u8,
    pub used: bool,
    pub record: ConditionalRecord,
}

impl Trigger {
    pub fn new(id: u8) -> Self {
        Trigger {
            id,
            used: is_used(id),
            record: ConditionalRecord::default(),
        }
    }

    pub fn pointer(id: u8) -> u32 {
        POINTER_TABLE + (((id & 0x7F) as u32) << 1)
    }

    pub fn from_image(image: &[u8], id: u8) -> Result<Self> {
        let pointer = Self::pointer(id);
        let offset = read_u16_le(image, pointer as usize).ok_or(PatchError::OutOfBounds {
            start: pointer,
            end: pointer + 2,
            len: image.len(),
        })?;
        let (record, _) = record::decode(image, offset as usize + DATA_BASE as usize)?;
        Ok(Trigger {
            id,
            used: is_used(id),
            record,
        })
    }

    pub fn conditions(&self) -> &[FlagRef] {
        &self.record.conditions
    }

    pub fn message(&self) -> MessageId {
        self.record.message
    }

    pub fn effects(&self) -> &[FlagRef] {
        &self.record.effects
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.record.to_bytes()
    }

    /// Queues the record and repoints the trigger table; unused triggers
    /// are skipped.
    pub fn write(&self, writer: &mut Writer) -> Option<WriteId> {
        if !self.used {
            return None;
        }
        let pointer = Self::pointer(self.id);
        let id = writer.write_then(
            self.bytes(),
            BANK_START,
            BANK_END,
            format!("Trigger {:02x}", self.id),
            move |w, addr| {
                let addr = addr?;
                w.patch_u16_le(pointer, (addr - DATA_BASE) as u16)
            },
        );
        Some(id)
    }
}

fn is_used(id: u8) -> bool {
    !UNUSED_TRIGGERS.contains(&id)
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn list(refs: &[FlagRef]) -> String {
            refs.iter()
                .map(|r| {
                    if r.is_negated() {
                        format!("!{:03x}", r.flag())
                    } else {
                        format!("{:03x}", r.flag())
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        }
        write!(
            f,
            "trigger {:02x}{}: if [{}] message {} then [{}]",
            self.id,
            if self.used { "" } else { " (unused)" },
            list(self.conditions()),
            self.message(),
            list(self.effects()),
        )
    }
}
