use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

pub mod bitfield;
pub mod chunk;
pub mod config;
pub mod image;
pub mod message;
pub mod object;
pub mod record;
pub mod trigger;
pub mod writer;

pub use chunk::Chunk;
pub use config::PatchManifest;
pub use message::MessageId;
pub use object::ObjectData;
pub use record::{ConditionalRecord, FlagRef};
pub use trigger::Trigger;
pub use writer::{CommitStats, OutOfSpaceError, Settled, WriteId, Writer};

use config::byte_id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSettings {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub manifest_path: PathBuf,
    pub debug: bool,
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("region ${start:05x}..${end:05x} crosses a {bank_size:#x}-byte bank boundary")]
    Span { start: u32, end: u32, bank_size: u32 },
    #[error("region ${start:05x}..${end:05x} is empty")]
    EmptyRegion { start: u32, end: u32 },
    #[error("region ${start:05x}..${end:05x} lies outside the {len:#x}-byte image")]
    OutOfBounds { start: u32, end: u32, len: usize },
    #[error(transparent)]
    OutOfSpace(#[from] OutOfSpaceError),
    #[error("record at {offset:#x} has more than {limit} entries in one list")]
    RecordOverflow { offset: usize, limit: usize },
    #[error("record at {offset:#x} runs past the end of the image")]
    RecordTruncated { offset: usize },
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// What a run placed, and where.
#[derive(Debug, Clone, Default)]
pub struct PatchReport {
    pub stats: CommitStats,
    pub writes: Vec<(String, Settled)>,
    pub free: Vec<(u32, u32)>,
}

impl PatchReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} rounds, {} placed, {} deduplicated, {} rejected, {} bytes written",
            self.stats.rounds,
            self.stats.placed,
            self.stats.deduplicated,
            self.stats.rejected,
            self.stats.bytes_written
        );
        out.push_str("\nwrites:\n");
        for (name, settled) in &self.writes {
            match &settled.result {
                Ok(addr) => {
                    let _ = writeln!(out, "  [{}] {:<24} ${:05x}", settled.round, name, addr);
                }
                Err(err) => {
                    let _ = writeln!(out, "  [{}] {:<24} FAILED: {}", settled.round, name, err);
                }
            }
        }
        out.push_str("\nfree space by bank:\n");
        for (bank, free) in &self.free {
            let _ = writeln!(out, "  bank {:#04x}: {} bytes", bank, free);
        }
        out
    }
}

/// Applies every edit in `manifest` to `image` and commits the result.
///
/// A write that finds no room fails the whole run.
pub fn apply_manifest(
    image: Vec<u8>,
    manifest: &PatchManifest,
) -> Result<(Vec<u8>, PatchReport)> {
    manifest.validate()?;
    let mut writer = Writer::with_bank_bits(image, manifest.bank_bits)?;
    for region in &manifest.free {
        writer.alloc(region.start.0, region.end.0)?;
    }

    let mut ids: Vec<(String, WriteId)> = Vec::new();

    for edit in &manifest.objects {
        let id = byte_id("object", edit.id)?;
        let mut object = ObjectData::from_image(writer.image(), id)?;
        if let Some(sfx) = edit.sfx {
            object.sfx = byte_id("object sfx", sfx)?;
        }
        for (name, value) in &edit.set {
            object.set_named(name, value.0)?;
        }
        debug!("object {:02x}: {} bytes", id, object.serialize().len());
        ids.push((format!("Object {:02x}", id), object.write(&mut writer)));
    }

    for edit in &manifest.triggers {
        let id = byte_id("trigger", edit.id)?;
        // A full replacement never reads the old record, so it also works
        // where the table still points at garbage.
        let mut trigger = if edit.replaces_record() {
            Trigger::new(id)
        } else {
            Trigger::from_image(writer.image(), id)?
        };
        if let Some(conditions) = &edit.conditions {
            trigger.record.conditions = conditions.iter().map(|f| f.0).collect();
        }
        if let Some(message) = edit.message {
            trigger.record.message = MessageId::from_word(message.0 as u16);
        }
        if let Some(effects) = &edit.effects {
            trigger.record.effects = effects.iter().map(|f| f.0).collect();
        }
        if let Some(used) = edit.used {
            trigger.used = used;
        }
        debug!("{}", trigger);
        if let Some(write) = trigger.write(&mut writer) {
            ids.push((format!("Trigger {:02x}", id), write));
        }
    }

    for blob in &manifest.blobs {
        let id = match blob.pointer.clone() {
            Some(pointer) => {
                let name = blob.name.clone();
                writer.write_then(
                    blob.data.clone(),
                    blob.start.0,
                    blob.end.0,
                    blob.name.clone(),
                    move |w, addr| {
                        let addr = addr?;
                        let value = addr
                            .checked_sub(pointer.base.0)
                            .and_then(|v| u16::try_from(v).ok())
                            .ok_or_else(|| {
                                PatchError::Config(format!(
                                    "blob '{}' at ${:05x} is not reachable from base ${:05x}",
                                    name, addr, pointer.base.0
                                ))
                            })?;
                        w.patch(pointer.at.0, &pointer.endian.to_bytes(value))
                    },
                )
            }
            None => writer.write(blob.data.clone(), blob.start.0, blob.end.0, blob.name.clone()),
        };
        ids.push((blob.name.clone(), id));
    }

    let stats = writer.commit()?;

    let mut report = PatchReport {
        stats,
        writes: Vec::with_capacity(ids.len()),
        free: writer.free_by_bank().collect(),
    };
    for (name, id) in ids {
        if let Some(settled) = writer.outcome(id) {
            if let Err(err) = &settled.result {
                return Err(PatchError::OutOfSpace(err.clone()));
            }
            report.writes.push((name, settled.clone()));
        }
    }

    Ok((writer.into_image(), report))
}

pub fn run(settings: PatchSettings) -> Result<PatchReport> {
    if !settings.input_path.exists() {
        return Err(PatchError::Config(format!(
            "Input path does not exist: {}",
            settings.input_path.display()
        )));
    }

    let manifest = PatchManifest::load(&settings.manifest_path)?;
    let image = fs::read(&settings.input_path)?;
    info!(
        "patching {} ({} bytes) with {}",
        settings.input_path.display(),
        image.len(),
        settings.manifest_path.display()
    );

    let (image, report) = apply_manifest(image, &manifest)?;

    if let Some(parent) = settings.output_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&settings.output_path, &image)?;
    info!("wrote {}", settings.output_path.display());

    if settings.debug {
        let report_path = settings.output_path.with_file_name("patch_report.txt");
        fs::write(&report_path, report.render())?;
        info!("report written to {}", report_path.display());
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::read_u16_le;

    fn blank_image() -> Vec<u8> {
        vec![0u8; 0x20000]
    }

    #[test]
    fn applies_objects_triggers_and_blobs() {
        let manifest = PatchManifest::from_json(
            r#"{
                "free": [
                    { "start": "0x1b800", "end": "0x1b900" },
                    { "start": "0x1f000", "end": "0x1f100" },
                    { "start": "0x0400", "end": "0x0500" }
                ],
                "objects": [{ "id": "0x50", "sfx": 2, "set": { "hp": 40, "atk": 5 } }],
                "triggers": [{
                    "id": "0x85",
                    "conditions": ["0x20", "!0x21"],
                    "message": "0x0b01",
                    "effects": ["0x30"]
                }],
                "blobs": [{
                    "name": "text",
                    "data": [9, 8, 7],
                    "start": "0x0000",
                    "end": "0x2000",
                    "pointer": { "at": "0x0010", "base": "0x0000", "endian": "big" }
                }]
            }"#,
        )
        .unwrap();

        let (image, report) = apply_manifest(blank_image(), &manifest).unwrap();

        let object = ObjectData::from_image(&image, 0x50).unwrap();
        assert_eq!(object.sfx, 2);
        assert_eq!(object.get(&object::HP), 40);
        assert_eq!(object.get(&object::ATK), 5);
        assert_eq!(
            read_u16_le(&image, ObjectData::pointer(0x50) as usize),
            Some(0xB800)
        );

        let trigger = Trigger::from_image(&image, 0x85).unwrap();
        assert_eq!(
            trigger.conditions(),
            &[FlagRef::set(0x20), FlagRef::negated(0x21)]
        );
        assert_eq!(trigger.message(), MessageId::from_word(0x0B01));
        assert_eq!(trigger.effects(), &[FlagRef::set(0x30)]);

        assert_eq!(&image[0x0400..0x0403], &[9, 8, 7]);
        assert_eq!(&image[0x0010..0x0012], &[0x04, 0x00]);

        assert_eq!(report.stats.placed, 3);
        assert_eq!(report.writes.len(), 3);
        let rendered = report.render();
        assert!(rendered.contains("Object 50"));
        assert!(rendered.contains("$1f000"));
    }

    #[test]
    fn unused_trigger_is_left_alone() {
        let manifest = PatchManifest::from_json(
            r#"{
                "free": [{ "start": "0x1f000", "end": "0x1f100" }],
                "triggers": [{ "id": "0x88", "conditions": [], "message": 0, "effects": ["0x30"] }]
            }"#,
        )
        .unwrap();
        let (image, report) = apply_manifest(blank_image(), &manifest).unwrap();
        assert!(report.writes.is_empty());
        assert!(image[0x1F000..0x1F100].iter().all(|&b| b == 0));
    }

    #[test]
    fn partial_trigger_edit_keeps_the_rest_of_the_record() {
        let mut image = blank_image();
        let record = ConditionalRecord {
            conditions: vec![FlagRef::set(0x40)],
            message: MessageId::from_word(0x0203),
            effects: vec![FlagRef::negated(0x41)],
        };
        image[0x1E400..0x1E406].copy_from_slice(&record.to_bytes());
        let pointer = Trigger::pointer(0x90) as usize;
        image[pointer..pointer + 2].copy_from_slice(&0xA400u16.to_le_bytes());

        let manifest = PatchManifest::from_json(
            r#"{
                "free": [{ "start": "0x1f000", "end": "0x1f100" }],
                "triggers": [{ "id": "0x90", "message": "0x0204" }]
            }"#,
        )
        .unwrap();
        let (image, _) = apply_manifest(image, &manifest).unwrap();
        let trigger = Trigger::from_image(&image, 0x90).unwrap();
        assert_eq!(trigger.conditions(), &[FlagRef::set(0x40)]);
        assert_eq!(trigger.message(), MessageId::from_word(0x0204));
        assert_eq!(trigger.effects(), &[FlagRef::negated(0x41)]);
    }

    #[test]
    fn rejected_write_fails_the_run() {
        let manifest = PatchManifest::from_json(
            r#"{
                "free": [{ "start": "0x0400", "end": "0x0402" }],
                "blobs": [{ "name": "big", "data": [1, 2, 3], "start": 0, "end": "0x2000" }]
            }"#,
        )
        .unwrap();
        match apply_manifest(blank_image(), &manifest) {
            Err(PatchError::OutOfSpace(err)) => assert_eq!(err.name, "big"),
            other => panic!("expected out of space, got {:?}", other.map(|(_, r)| r)),
        }
    }

    #[test]
    fn free_region_across_a_bank_is_split() {
        let manifest = PatchManifest::from_json(
            r#"{ "bank_bits": 4, "free": [{ "start": "0x0c", "end": "0x14" }] }"#,
        )
        .unwrap();
        let (_, report) = apply_manifest(vec![0; 0x20], &manifest).unwrap();
        assert_eq!(report.free, vec![(0, 4), (1, 4)]);
    }

    #[test]
    fn unknown_object_property_is_a_config_error() {
        let manifest =
            PatchManifest::from_json(r#"{ "objects": [{ "id": 1, "set": { "wings": 1 } }] }"#)
                .unwrap();
        assert!(matches!(
            apply_manifest(blank_image(), &manifest),
            Err(PatchError::Config(_))
        ));
    }

    #[test]
    fn unreachable_pointer_base_is_reported() {
        let manifest = PatchManifest::from_json(
            r#"{
                "free": [{ "start": "0x0400", "end": "0x0500" }],
                "blobs": [{
                    "name": "low",
                    "data": [1],
                    "start": 0,
                    "end": "0x2000",
                    "pointer": { "at": 0, "base": "0x0800" }
                }]
            }"#,
        )
        .unwrap();
        assert!(matches!(
            apply_manifest(blank_image(), &manifest),
            Err(PatchError::Config(_))
        ));
    }

    #[test]
    fn run_writes_image_and_debug_report() {
        let dir = std::env::temp_dir().join(format!("rompatch-run-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let input = dir.join("in.bin");
        let manifest_path = dir.join("patch.json");
        fs::write(&input, vec![0u8; 0x4000]).unwrap();
        fs::write(
            &manifest_path,
            r#"{
                "free": [{ "start": "0x2000", "end": "0x2100" }],
                "blobs": [{ "name": "b", "data": [5, 6], "start": "0x2000", "end": "0x4000" }]
            }"#,
        )
        .unwrap();

        let settings = PatchSettings {
            input_path: input,
            output_path: dir.join("out").join("patched.bin"),
            manifest_path,
            debug: true,
        };
        let report = run(settings.clone()).unwrap();
        assert_eq!(report.stats.bytes_written, 2);

        let patched = fs::read(&settings.output_path).unwrap();
        assert_eq!(&patched[0x2000..0x2002], &[5, 6]);
        let rendered = fs::read_to_string(dir.join("out").join("patch_report.txt")).unwrap();
        assert!(rendered.contains("$02000"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn run_rejects_missing_input() {
        let settings = PatchSettings {
            input_path: PathBuf::from("/nonexistent/rompatch/input.bin"),
            output_path: PathBuf::from("/nonexistent/rompatch/out.bin"),
            manifest_path: PathBuf::from("/nonexistent/rompatch/patch.json"),
            debug: false,
        };
        assert!(matches!(run(settings), Err(PatchError::Config(_))));
    }
}
