use crate::image::read_u16_be;
use crate::message::{MessageId, MESSAGE_ID_LEN};
use crate::{PatchError, Result};

/// Upper bound on entries per list before a scan is treated as runaway.
pub const MAX_LIST_ENTRIES: usize = 32;

const FLAG_MASK: u16 = 0x1FFF;

const CONDITION_NEGATE: u16 = 0x2000;
const CONDITION_LAST: u16 = 0x8000;
const EFFECT_NEGATE: u16 = 0x8000;
const EFFECT_LAST: u16 = 0x4000;

/// Signed reference to a game flag. Negated references hold the bitwise
/// NOT of the flag number, so `!0` means "flag 0 clear".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FlagRef(pub i32);

impl FlagRef {
    /// Placeholder written for an empty list.
    pub const SENTINEL: FlagRef = FlagRef(!0);

    pub fn set(flag: u16) -> Self {
        FlagRef(flag as i32)
    }

    pub fn negated(flag: u16) -> Self {
        FlagRef(!(flag as i32))
    }

    pub fn is_negated(&self) -> bool {
        self.0 < 0
    }

    pub fn flag(&self) -> u16 {
        let raw = if self.0 < 0 { !self.0 } else { self.0 };
        raw as u16 & FLAG_MASK
    }

    fn encode(&self, negate_bit: u16) -> u16 {
        let mut word = self.flag();
        if self.is_negated() {
            word |= negate_bit;
        }
        word
    }

    fn decode(word: u16, negate_bit: u16) -> Self {
        let flag = word & FLAG_MASK;
        if word & negate_bit != 0 {
            FlagRef::negated(flag)
        } else {
            FlagRef::set(flag)
        }
    }
}

impl From<i32> for FlagRef {
    fn from(raw: i32) -> Self {
        FlagRef(raw)
    }
}

/// Conditions to check, the message shown, and the flags changed after.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConditionalRecord {
    pub conditions: Vec<FlagRef>,
    pub message: MessageId,
    pub effects: Vec<FlagRef>,
}

impl ConditionalRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.conditions, self.message, &self.effects)
    }

    /// Replaces empty lists with the sentinel, matching what decoding
    /// an encoded record yields.
    pub fn canonicalize(&mut self) {
        if self.conditions.is_empty() {
            self.conditions.push(FlagRef::SENTINEL);
        }
        if self.effects.is_empty() {
            self.effects.push(FlagRef::SENTINEL);
        }
    }

    /// Size of the encoded form, counting sentinels for empty lists.
    pub fn encoded_len(&self) -> usize {
        2 * self.conditions.len().max(1) + MESSAGE_ID_LEN + 2 * self.effects.len().max(1)
    }
}

pub fn encode(conditions: &[FlagRef], message: MessageId, effects: &[FlagRef]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * (conditions.len() + effects.len()) + 6);
    encode_list(&mut out, conditions, CONDITION_NEGATE, CONDITION_LAST);
    out.extend_from_slice(&message.bytes());
    encode_list(&mut out, effects, EFFECT_NEGATE, EFFECT_LAST);
    out
}

fn encode_list(out: &mut Vec<u8>, list: &[FlagRef], negate_bit: u16, last_bit: u16) {
    let sentinel = [FlagRef::SENTINEL];
    let list = if list.is_empty() { &sentinel[..] } else { list };
    for (i, flag) in list.iter().enumerate() {
        let mut word = flag.encode(negate_bit);
        if i == list.len() - 1 {
            word |= last_bit;
        }
        out.extend_from_slice(&word.to_be_bytes());
    }
}

/// Decodes one record starting at `offset`, returning it together with the
/// number of bytes it occupied.
pub fn decode(buf: &[u8], offset: usize) -> Result<(ConditionalRecord, usize)> {
    let mut pos = offset;
    let conditions = decode_list(buf, offset, &mut pos, CONDITION_NEGATE, CONDITION_LAST)?;

    let message_bytes = buf
        .get(pos..pos + MESSAGE_ID_LEN)
        .ok_or(PatchError::RecordTruncated { offset })?;
    let message = MessageId::from_bytes([message_bytes[0], message_bytes[1]]);
    pos += MESSAGE_ID_LEN;

    let effects = decode_list(buf, offset, &mut pos, EFFECT_NEGATE, EFFECT_LAST)?;

    let record = ConditionalRecord {
        conditions,
        message,
        effects,
    };
    Ok((record, pos - offset))
}

fn decode_list(
    buf: &[u8],
    offset: usize,
    pos: &mut usize,
    negate_bit: u16,
    last_bit: u16,
) -> Result<Vec<FlagRef>> {
    let mut list = Vec::new();
    loop {
        if list.len() == MAX_LIST_ENTRIES {
            return Err(PatchError::RecordOverflow {
                offset,
                limit: MAX_LIST_ENTRIES,
            });
        }
        let word = read_u16_be(buf, *pos).ok_or(PatchError::RecordTruncated { offset })?;
        *pos += 2;
        list.push(FlagRef::decode(word, negate_bit));
        if word & last_bit != 0 {
            return Ok(list);
        }
    }
}
