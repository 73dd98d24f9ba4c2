use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

use rompatch_core::{run, ObjectData, PatchSettings, Trigger};

#[derive(Debug, Parser)]
#[command(name = "rompatch", version, about = "Places data patches into free ROM space")]
struct Args {
    #[arg(long)]
    input: PathBuf,

    #[arg(long, required_unless_present_any = ["dump_trigger", "dump_object"])]
    output: Option<PathBuf>,

    #[arg(long, required_unless_present_any = ["dump_trigger", "dump_object"])]
    manifest: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Debug-only: print the trigger record with this id and exit.
    #[arg(long, value_name = "ID", value_parser = parse_id, hide = true)]
    dump_trigger: Option<u8>,

    /// Debug-only: print the object stat block with this id and exit.
    #[arg(long, value_name = "ID", value_parser = parse_id, hide = true)]
    dump_object: Option<u8>,
}

fn parse_id(text: &str) -> Result<u8, String> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| format!("'{}' is not a byte id", text))
}

fn setup_logger(debug: bool) -> Result<(), fern::InitError> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

fn dump(args: &Args) -> Result<(), String> {
    let image = std::fs::read(&args.input)
        .map_err(|e| format!("Failed to read {:?}: {}", args.input, e))?;
    if let Some(id) = args.dump_trigger {
        let trigger = Trigger::from_image(&image, id).map_err(|e| e.to_string())?;
        println!("{}", trigger);
        println!("  bytes: {:02x?}", trigger.bytes());
    }
    if let Some(id) = args.dump_object {
        let object = ObjectData::from_image(&image, id).map_err(|e| e.to_string())?;
        println!("object {:02x} sfx={:02x}", object.id, object.sfx);
        for prop in rompatch_core::object::OBJECT_PROPS {
            println!("  {:<24} {}", prop.name, object.get(prop));
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(err) = setup_logger(args.debug) {
        eprintln!("Failed to set up logging: {err}");
    }

    // Debug path: inspect records in the input image and exit.
    if args.dump_trigger.is_some() || args.dump_object.is_some() {
        if let Err(err) = dump(&args) {
            eprintln!("{err}");
            std::process::exit(1);
        }
        return;
    }

    let (Some(output_path), Some(manifest_path)) = (args.output, args.manifest) else {
        eprintln!("Error: --output and --manifest are required");
        std::process::exit(1);
    };

    let settings = PatchSettings {
        input_path: args.input,
        output_path,
        manifest_path,
        debug: args.debug,
    };

    if let Err(err) = run(settings) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
