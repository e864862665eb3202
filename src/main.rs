#![warn(clippy::unwrap_used)]

use clap::Parser;
use std::path::PathBuf;

use depua::{
    document::{dump_text, repair_file, RepairOptions},
    error::ContextError,
};

#[derive(Parser, Debug)]
#[command(version, about = "Repair the PUA-encoded text layer of an OCR'd PDF", long_about = None)]
struct CliArguments {
    #[arg(short = 'i', long = "input", value_name = "pdf_file")]
    input_path: PathBuf,
    #[arg(short = 'o', long = "output", value_name = "pdf_file")]
    output_path: PathBuf,
    #[arg(
        long = "font",
        value_name = "ttf_file",
        default_value = "NotoSansKR-Regular.ttf",
        help = "Font used for the overlay text layer"
    )]
    font_path: PathBuf,
    #[arg(
        short = 'm',
        long = "mapping",
        value_name = "json_file",
        help = "Extra PUA mapping table merged over the built-in one"
    )]
    mapping_path: Option<PathBuf>,
    #[arg(
        short = 'd',
        long = "display",
        help = "Paint the overlay in a visible color instead of hiding it, for proofreading"
    )]
    display: bool,
    #[arg(
        long = "print-text",
        help = "Print the text layer of the repaired document after saving it"
    )]
    print_text: bool,
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help = "Increase the logging verbosity (-v for debug, -vv for trace)")]
    verbosity: u8,
}

fn main() {
    if let Err(error) = fallible_main() {
        log::error!("{}", error);
        std::process::exit(1);
    }
}

fn fallible_main() -> Result<(), ContextError> {
    let arguments = CliArguments::parse();
    let level = match arguments.verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .init();
    log::debug!("{:?}", arguments);

    let options = RepairOptions {
        overlay_font_path: arguments.font_path,
        mapping_path: arguments.mapping_path,
        visible_overlay: arguments.display,
        ..RepairOptions::default()
    };

    let summary = repair_file(&arguments.input_path, &arguments.output_path, &options)?;
    log::info!(
        "Saved the repaired document to {:?}: {} pages, {} glyphs painted as paths, {} spans overlaid",
        arguments.output_path,
        summary.pages,
        summary.painted_glyphs,
        summary.overlaid_spans,
    );
    if summary.dropped_glyphs > 0 {
        log::warn!(
            "{} glyphs had no embeddable outline and were removed from the page",
            summary.dropped_glyphs
        );
    }

    if arguments.print_text {
        dump_text(&arguments.output_path)?;
    }

    Ok(())
}
