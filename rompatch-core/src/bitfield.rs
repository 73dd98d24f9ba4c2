/// One (offset, mask, shift) cell of a packed property.
///
/// A positive shift moves the masked bits down when reading; a negative
/// shift moves them up, so a single property can gather its low bits from
/// one byte and its high bits from another.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cell {
    pub offset: usize,
    pub mask: u8,
    pub shift: i8,
}

impl Cell {
    /// Whole byte at `offset`.
    pub const fn byte(offset: usize) -> Self {
        Cell {
            offset,
            mask: 0xFF,
            shift: 0,
        }
    }

    pub const fn masked(offset: usize, mask: u8, shift: i8) -> Self {
        Cell {
            offset,
            mask,
            shift,
        }
    }

    fn shifts(&self) -> (u32, u32) {
        if self.shift < 0 {
            (self.shift.unsigned_abs() as u32, 0)
        } else {
            (0, self.shift as u32)
        }
    }
}

/// A named property backed by one or more cells.
#[derive(Copy, Clone, Debug)]
pub struct Prop {
    pub name: &'static str,
    pub cells: &'static [Cell],
}

impl Prop {
    pub const fn new(name: &'static str, cells: &'static [Cell]) -> Self {
        Prop { name, cells }
    }

    pub fn get(&self, buf: &[u8]) -> u32 {
        get(self.cells, buf)
    }

    pub fn set(&self, buf: &mut [u8], value: u32) {
        set(self.cells, buf, value)
    }

    /// Largest value every cell together can hold.
    pub fn max_value(&self) -> u32 {
        self.cells.iter().fold(0u32, |acc, cell| {
            let (lsh, rsh) = cell.shifts();
            acc | ((cell.mask as u32) >> rsh) << lsh
        })
    }
}

pub fn get(cells: &[Cell], buf: &[u8]) -> u32 {
    let mut value = 0u32;
    for cell in cells {
        let (lsh, rsh) = cell.shifts();
        value |= ((buf[cell.offset] & cell.mask) as u32 >> rsh) << lsh;
    }
    value
}

/// Masked read-modify-write of every cell; bits outside the masks are kept.
pub fn set(cells: &[Cell], buf: &mut [u8], value: u32) {
    for cell in cells {
        let (lsh, rsh) = cell.shifts();
        let bits = (((value >> lsh) << rsh) & cell.mask as u32) as u8;
        buf[cell.offset] = (buf[cell.offset] & !cell.mask) | bits;
    }
}

pub fn find<'a>(table: &'a [Prop], name: &str) -> Option<&'a Prop> {
    table.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Returns the first pair of properties in `table` whose cells claim the
/// same bits of the same byte.
pub fn check_disjoint(table: &[Prop]) -> Option<(&'static str, &'static str)> {
    for (i, a) in table.iter().enumerate() {
        for b in &table[i + 1..] {
            let clash = a.cells.iter().any(|ca| {
                b.cells
                    .iter()
                    .any(|cb| ca.offset == cb.offset && ca.mask & cb.mask != 0)
            });
            if clash {
                return Some((a.name, b.name));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOW: Prop = Prop::new("low", &[Cell::masked(0, 0x0F, 0)]);
    const HIGH: Prop = Prop::new("high", &[Cell::masked(0, 0xF0, 4)]);
    // Bit 4 lives in byte 1, bits 0-3 in byte 2.
    const SPLIT: Prop = Prop::new(
        "split",
        &[Cell::masked(1, 0x40, 2), Cell::masked(2, 0x0F, 0)],
    );
    const FLAG: Prop = Prop::new("flag", &[Cell::masked(1, 0x80, 7)]);
    const CLASH: Prop = Prop::new("clash", &[Cell::masked(0, 0x18, 3)]);
    const WIDE: Prop = Prop::new("wide", &[Cell::byte(3), Cell::masked(4, 0x03, -8)]);

    const TABLE: &[Prop] = &[LOW, HIGH, SPLIT, FLAG, WIDE];

    #[test]
    fn round_trips_every_legal_value() {
        for prop in TABLE {
            for v in 0..=prop.max_value() {
                let mut buf = [0u8; 5];
                prop.set(&mut buf, v);
                assert_eq!(prop.get(&buf), v, "{} value {}", prop.name, v);
            }
        }
    }

    #[test]
    fn set_preserves_unrelated_bits() {
        let mut buf = [0xFFu8; 5];
        LOW.set(&mut buf, 0x3);
        assert_eq!(buf[0], 0xF3);
        assert_eq!(HIGH.get(&buf), 0xF);

        FLAG.set(&mut buf, 0);
        assert_eq!(buf[1], 0x7F);
        SPLIT.set(&mut buf, 0);
        assert_eq!(buf[1], 0x3F);
        assert_eq!(buf[2], 0xF0);
    }

    #[test]
    fn split_property_spans_two_bytes() {
        let mut buf = [0u8; 5];
        SPLIT.set(&mut buf, 0x1A);
        assert_eq!(buf[1], 0x40);
        assert_eq!(buf[2], 0x0A);
        assert_eq!(SPLIT.max_value(), 0x1F);
    }

    #[test]
    fn negative_shift_builds_high_bits() {
        let mut buf = [0u8; 5];
        WIDE.set(&mut buf, 0x2AB);
        assert_eq!(buf[3], 0xAB);
        assert_eq!(buf[4], 0x02);
        assert_eq!(WIDE.get(&buf), 0x2AB);
    }

    #[test]
    fn detects_overlapping_cells() {
        assert_eq!(check_disjoint(TABLE), None);
        let bad = [LOW, CLASH, HIGH];
        assert_eq!(check_disjoint(&bad), Some(("low", "clash")));
    }

    #[test]
    fn finds_props_by_name() {
        assert_eq!(find(TABLE, "Split").map(|p| p.name), Some("split"));
        assert!(find(TABLE, "missing").is_none());
    }
}
