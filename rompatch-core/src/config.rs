use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::chunk::{BANK_BITS, MAX_BANK_BITS};
use crate::image::Endian;
use crate::record::FlagRef;
use crate::{PatchError, Result};

fn default_bank_bits() -> u32 {
    BANK_BITS
}

/// A JSON-friendly number: either a plain integer or a `"0x"`-prefixed
/// hex string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Int(u64),
    Text(String),
}

fn parse_number(text: &str) -> std::result::Result<u64, String> {
    let text = text.trim();
    let parsed = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .or_else(|| text.strip_prefix('$'))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| format!("invalid number '{}'", text))
}

impl RawNumber {
    fn value(self) -> std::result::Result<u64, String> {
        match self {
            RawNumber::Int(n) => Ok(n),
            RawNumber::Text(s) => parse_number(&s),
        }
    }
}

/// An image address or other unsigned value read from the manifest.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "RawNumber")]
pub struct Address(pub u32);

impl TryFrom<RawNumber> for Address {
    type Error = String;

    fn try_from(raw: RawNumber) -> std::result::Result<Self, Self::Error> {
        let value = raw.value()?;
        u32::try_from(value)
            .map(Address)
            .map_err(|_| format!("value {:#x} does not fit in 32 bits", value))
    }
}

/// A flag reference; `"!0x20"` (or `"~0x20"`) is the negated form.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "RawNumber")]
pub struct FlagSpec(pub FlagRef);

impl TryFrom<RawNumber> for FlagSpec {
    type Error = String;

    fn try_from(raw: RawNumber) -> std::result::Result<Self, Self::Error> {
        let (negated, value) = match raw {
            RawNumber::Int(n) => (false, n),
            RawNumber::Text(s) => match s.trim().strip_prefix(['!', '~']) {
                Some(rest) => (true, parse_number(rest)?),
                None => (false, parse_number(&s)?),
            },
        };
        if value > 0x1FFF {
            return Err(format!("flag {:#x} is wider than 13 bits", value));
        }
        let flag = value as u16;
        Ok(FlagSpec(if negated {
            FlagRef::negated(flag)
        } else {
            FlagRef::set(flag)
        }))
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Region {
    pub start: Address,
    pub end: Address,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ObjectEdit {
    pub id: Address,
    #[serde(default)]
    pub sfx: Option<Address>,
    #[serde(default)]
    pub set: BTreeMap<String, Address>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TriggerEdit {
    pub id: Address,
    #[serde(default)]
    pub conditions: Option<Vec<FlagSpec>>,
    #[serde(default)]
    pub message: Option<Address>,
    #[serde(default)]
    pub effects: Option<Vec<FlagSpec>>,
    #[serde(default)]
    pub used: Option<bool>,
}

impl TriggerEdit {
    /// True when the edit supplies every part of the record.
    pub fn replaces_record(&self) -> bool {
        self.conditions.is_some() && self.message.is_some() && self.effects.is_some()
    }
}

/// Where to store a blob's final address once it is placed.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct PointerSpec {
    pub at: Address,
    #[serde(default = "zero")]
    pub base: Address,
    #[serde(default)]
    pub endian: Endian,
}

fn zero() -> Address {
    Address(0)
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct BlobWrite {
    pub name: String,
    pub data: Vec<u8>,
    pub start: Address,
    pub end: Address,
    #[serde(default)]
    pub pointer: Option<PointerSpec>,
}

/// Everything one run places into the image.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PatchManifest {
    #[serde(default = "default_bank_bits")]
    pub bank_bits: u32,
    #[serde(default)]
    pub free: Vec<Region>,
    #[serde(default)]
    pub objects: Vec<ObjectEdit>,
    #[serde(default)]
    pub triggers: Vec<TriggerEdit>,
    #[serde(default)]
    pub blobs: Vec<BlobWrite>,
}

impl Default for PatchManifest {
    fn default() -> Self {
        PatchManifest {
            bank_bits: BANK_BITS,
            free: Vec::new(),
            objects: Vec::new(),
            triggers: Vec::new(),
            blobs: Vec::new(),
        }
    }
}

impl PatchManifest {
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: PatchManifest = serde_json::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Rejects values that would otherwise only fail deep inside a commit.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BANK_BITS).contains(&self.bank_bits) {
            return Err(PatchError::Config(format!(
                "bank_bits must be between 1 and {}, got {}",
                MAX_BANK_BITS, self.bank_bits
            )));
        }
        for object in &self.objects {
            byte_id("object", object.id)?;
            if let Some(sfx) = object.sfx {
                byte_id("object sfx", sfx)?;
            }
        }
        for trigger in &self.triggers {
            let id = byte_id("trigger", trigger.id)?;
            if id < 0x80 {
                return Err(PatchError::Config(format!(
                    "trigger id {:#04x} is below 0x80",
                    id
                )));
            }
            if let Some(message) = trigger.message {
                if message.0 > 0xFFFF {
                    return Err(PatchError::Config(format!(
                        "trigger {:02x}: message id {:#x} is wider than 16 bits",
                        id, message.0
                    )));
                }
            }
        }
        for blob in &self.blobs {
            if blob.start.0 >= blob.end.0 {
                return Err(PatchError::Config(format!(
                    "blob '{}': range ${:05x}..${:05x} is empty",
                    blob.name, blob.start.0, blob.end.0
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn byte_id(what: &str, id: Address) -> Result<u8> {
    u8::try_from(id.0)
        .map_err(|_| PatchError::Config(format!("{} id {:#x} does not fit in a byte", what, id.0)))
}
