use crate::bitfield::{self, Cell, Prop};
use crate::image::read_u16_le;
use crate::writer::{WriteId, Writer};
use crate::{PatchError, Result};

const POINTER_TABLE: u32 = 0x1AC00;
const DATA_BASE: u32 = 0x10000;
const BANK_START: u32 = 0x1A000;
const BANK_END: u32 = 0x1C000;

/// Number of per-object RAM slots carried by a record.
pub const SLOT_COUNT: usize = 32;

/// Maps a RAM table address ($300, $320, ...) to its slot in `data`.
const fn ram(addr: u16) -> usize {
    ((addr - 0x300) >> 5) as usize
}

pub const METASPRITE: Prop = Prop::new("metasprite", &[Cell::byte(ram(0x300))]);
pub const SPEED: Prop = Prop::new("speed", &[Cell::masked(ram(0x340), 0x0F, 0)]);
pub const COLLISION_PLANE: Prop =
    Prop::new("collision_plane", &[Cell::masked(ram(0x3A0), 0xF0, 4)]);
pub const HITBOX: Prop = Prop::new(
    "hitbox",
    &[Cell::masked(ram(0x420), 0x40, 2), Cell::masked(ram(0x3A0), 0x0F, 0)],
);
pub const HP: Prop = Prop::new("hp", &[Cell::byte(ram(0x3C0))]);
pub const ATK: Prop = Prop::new("atk", &[Cell::byte(ram(0x3E0))]);
pub const DEF: Prop = Prop::new("def", &[Cell::byte(ram(0x400))]);
pub const LEVEL: Prop = Prop::new("level", &[Cell::masked(ram(0x420), 0x1F, 0)]);
pub const POISON: Prop = Prop::new("poison", &[Cell::masked(ram(0x420), 0x80, 7)]);
/// Ad-hoc spawn index.
pub const CHILD: Prop = Prop::new("child", &[Cell::byte(ram(0x440))]);
pub const TERRAIN_SUSCEPTIBILITY: Prop =
    Prop::new("terrain_susceptibility", &[Cell::byte(ram(0x460))]);
/// Not knocked back when hit.
pub const IMMOBILE: Prop = Prop::new("immobile", &[Cell::masked(ram(0x4A0), 0x80, 7)]);
pub const ACTION: Prop = Prop::new("action", &[Cell::masked(ram(0x4A0), 0x7F, 0)]);
pub const REPLACEMENT: Prop = Prop::new("replacement", &[Cell::byte(ram(0x4C0))]);
pub const GOLD_DROP: Prop = Prop::new("gold_drop", &[Cell::masked(ram(0x500), 0xF0, 4)]);
pub const ELEMENTS: Prop = Prop::new("elements", &[Cell::masked(ram(0x500), 0x0F, 0)]);
/// Unprocessed experience reward ($520,x).
pub const EXP_REWARD: Prop = Prop::new("exp_reward", &[Cell::byte(ram(0x520))]);
pub const ATTACK_TYPE: Prop = Prop::new("attack_type", &[Cell::byte(ram(0x540))]);
pub const STATUS_EFFECT: Prop = Prop::new("status_effect", &[Cell::masked(ram(0x560), 0x0F, 0)]);

pub const OBJECT_PROPS: &[Prop] = &[
    METASPRITE,
    SPEED,
    COLLISION_PLANE,
    HITBOX,
    HP,
    ATK,
    DEF,
    LEVEL,
    POISON,
    CHILD,
    TERRAIN_SUSCEPTIBILITY,
    IMMOBILE,
    ACTION,
    REPLACEMENT,
    GOLD_DROP,
    ELEMENTS,
    EXP_REWARD,
    ATTACK_TYPE,
    STATUS_EFFECT,
];

/// Spawn-time stat block of a monster, NPC or projectile.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectData {
    pub id: u8,
    pub sfx: u8,
    pub data: [u8; SLOT_COUNT],
}

impl ObjectData {
    pub fn new(id: u8) -> Self {
        ObjectData {
            id,
            sfx: 0,
            data: [0; SLOT_COUNT],
        }
    }

    pub fn pointer(id: u8) -> u32 {
        POINTER_TABLE + ((id as u32) << 1)
    }

    pub fn from_image(image: &[u8], id: u8) -> Result<Self> {
        let pointer = Self::pointer(id);
        let offset = read_u16_le(image, pointer as usize).ok_or(PatchError::OutOfBounds {
            start: pointer,
            end: pointer + 2,
            len: image.len(),
        })?;
        let base = offset as usize + DATA_BASE as usize;
        let (sfx, data, _) =
            parse(image, base).ok_or(PatchError::RecordTruncated { offset: base })?;
        Ok(ObjectData { id, sfx, data })
    }

    pub fn get(&self, prop: &Prop) -> u32 {
        prop.get(&self.data)
    }

    pub fn set(&mut self, prop: &Prop, value: u32) {
        prop.set(&mut self.data, value)
    }

    /// Sets a property looked up by name, rejecting unknown names and
    /// values that do not fit its bits.
    pub fn set_named(&mut self, name: &str, value: u32) -> Result<()> {
        let prop = bitfield::find(OBJECT_PROPS, name)
            .ok_or_else(|| PatchError::Config(format!("unknown object property '{}'", name)))?;
        if value > prop.max_value() {
            return Err(PatchError::Config(format!(
                "value {} is out of range for object property '{}' (max {})",
                value,
                prop.name,
                prop.max_value()
            )));
        }
        self.set(prop, value);
        Ok(())
    }

    pub fn is_poison(&self) -> bool {
        self.get(&POISON) != 0
    }

    pub fn is_immobile(&self) -> bool {
        self.get(&IMMOBILE) != 0
    }

    /// 0 for wind, 1 for fire, 2 for water, 3 for thunder.
    pub fn is_vulnerable(&self, element: u8) -> bool {
        self.get(&ELEMENTS) & (1 << element) == 0
    }

    /// Sound effect byte, then four groups of a presence mask followed by
    /// the non-zero slots it marks, most significant bit first.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![self.sfx];
        for group in self.data.chunks(8) {
            let mask_at = out.len();
            out.push(0);
            for (j, &value) in group.iter().enumerate() {
                if value != 0 {
                    out[mask_at] |= 0x80 >> j;
                    out.push(value);
                }
            }
        }
        out
    }

    /// Queues this record and repoints the object table at wherever it lands.
    pub fn write(&self, writer: &mut Writer) -> WriteId {
        let pointer = Self::pointer(self.id);
        writer.write_then(
            self.serialize(),
            BANK_START,
            BANK_END,
            format!("Object {:02x}", self.id),
            move |w, addr| {
                let addr = addr?;
                w.patch_u16_le(pointer, (addr - DATA_BASE) as u16)
            },
        )
    }
}

/// Parses a serialized record at `base`; returns the sfx byte, the slots,
/// and the encoded length.
fn parse(buf: &[u8], base: usize) -> Option<(u8, [u8; SLOT_COUNT], usize)> {
    let sfx = *buf.get(base)?;
    let mut data = [0u8; SLOT_COUNT];
    let mut at = base + 1;
    let mut mask = 0u8;
    for (i, slot) in data.iter_mut().enumerate() {
        if i & 7 == 0 {
            mask = *buf.get(at)?;
            at += 1;
        }
        if mask & 0x80 != 0 {
            *slot = *buf.get(at)?;
            at += 1;
        }
        mask <<= 1;
    }
    Some((sfx, data, at - base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::check_disjoint;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn property_table_is_disjoint() {
        assert_eq!(check_disjoint(OBJECT_PROPS), None);
    }

    #[test]
    fn every_property_round_trips() {
        let mut rng = StdRng::seed_from_u64(0x0B1E);
        for prop in OBJECT_PROPS {
            for v in 0..=prop.max_value() {
                let mut object = ObjectData::new(0x50);
                object.data = rng.gen();
                let before = object.clone();
                object.set(prop, v);
                assert_eq!(object.get(prop), v, "{} = {}", prop.name, v);
                for other in OBJECT_PROPS.iter().filter(|p| p.name != prop.name) {
                    assert_eq!(
                        object.get(other),
                        before.get(other),
                        "{} clobbered {}",
                        prop.name,
                        other.name
                    );
                }
            }
        }
    }

    #[test]
    fn hitbox_spans_two_slots() {
        let mut object = ObjectData::new(0x50);
        object.set(&LEVEL, 0x1F);
        object.set(&COLLISION_PLANE, 0x0A);
        object.set(&HITBOX, 0x13);
        assert_eq!(object.data[ram(0x420)], 0x40 | 0x1F);
        assert_eq!(object.data[ram(0x3A0)], 0xA3);
        assert_eq!(object.get(&HITBOX), 0x13);
    }

    #[test]
    fn serializes_sparse_slots() {
        let mut object = ObjectData::new(0x50);
        object.sfx = 0x12;
        object.set(&METASPRITE, 0x20);
        object.set(&HP, 6);
        object.set(&STATUS_EFFECT, 3);

        // Slots 0 and 6, nothing in 8..16, slot 19, nothing in 24..32.
        let bytes = object.serialize();
        assert_eq!(bytes, vec![0x12, 0x82, 0x20, 0x06, 0x00, 0x10, 0x03, 0x00]);

        let (sfx, data, len) = parse(&bytes, 0).unwrap();
        assert_eq!(sfx, 0x12);
        assert_eq!(data, object.data);
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn parse_stops_at_end_of_buffer() {
        assert!(parse(&[0x12, 0x80], 0).is_none());
        assert!(parse(&[], 0).is_none());
    }

    #[test]
    fn truncated_record_is_reported() {
        let mut image = vec![0u8; 0x20000];
        image[ObjectData::pointer(0x52) as usize..][..2].copy_from_slice(&0xFFFEu16.to_le_bytes());
        // sfx and the first mask fit; the slot the mask promises does not.
        image[0x1FFFF] = 0x80;
        assert!(matches!(
            ObjectData::from_image(&image, 0x52),
            Err(PatchError::RecordTruncated { offset: 0x1FFFE })
        ));
    }

    #[test]
    fn set_named_checks_name_and_width() {
        let mut object = ObjectData::new(0x50);
        object.set_named("Speed", 9).unwrap();
        assert_eq!(object.get(&SPEED), 9);
        assert!(object.set_named("speed", 16).is_err());
        assert!(object.set_named("wings", 1).is_err());
        object.set_named("poison", 1).unwrap();
        assert!(object.is_poison());
        assert!(!object.is_immobile());
    }

    #[test]
    fn elements_mark_immunities() {
        let mut object = ObjectData::new(0x50);
        object.set(&ELEMENTS, 0b0101);
        assert!(!object.is_vulnerable(0));
        assert!(object.is_vulnerable(1));
        assert!(!object.is_vulnerable(2));
        assert!(object.is_vulnerable(3));
    }

    #[test]
    fn write_repoints_the_object_table() {
        let mut image = vec![0u8; 0x20000];
        let mut object = ObjectData::new(0x51);
        object.sfx = 7;
        object.set(&HP, 40);
        let record = object.serialize();
        image[0x1B000..0x1B000 + record.len()].copy_from_slice(&record);
        image[ObjectData::pointer(0x51) as usize..][..2].copy_from_slice(&0xB000u16.to_le_bytes());
        assert_eq!(ObjectData::from_image(&image, 0x51).unwrap(), object);

        let mut writer = Writer::new(image);
        writer.alloc(0x1B800, 0x1B900).unwrap();
        object.set(&ATK, 12);
        object.write(&mut writer);
        writer.commit().unwrap();

        let image = writer.into_image();
        let pointer = read_u16_le(&image, ObjectData::pointer(0x51) as usize).unwrap();
        assert_eq!(pointer, 0xB800);
        assert_eq!(ObjectData::from_image(&image, 0x51).unwrap(), object);
    }
}
