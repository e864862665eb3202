//! The end-to-end repair pipeline: load a PDF, strip the selectable text layer of
//! every page while keeping its ink, then lay a corrected Unicode text layer over
//! the original glyph geometry and save the result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lopdf::{content::Content, content::Operation, Object};
use time::OffsetDateTime;

use crate::{
    embedding::{OverlayFont, OverlayStyle, OVERLAY_FONT_RESOURCE},
    error::ContextError,
    extraction::{collect_spans, extract_page_spans},
    fonts::{collect_page_fonts, resolve},
    layouting::layout_span,
    mapping::PuaTable,
    stripping::strip_page_text,
};

/// Everything the repair pass needs to know besides the input and output paths.
#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Path to the TTF/OTF font used for the overlay text layer.
    pub overlay_font_path: PathBuf,
    /// An optional JSON mapping table merged over the built-in one.
    pub mapping_path: Option<PathBuf>,
    /// Paint the overlay in a visible color instead of rendering mode 3, which is
    /// useful for proofreading the remapped text.
    pub visible_overlay: bool,
    /// The fill color of a visible overlay, as RGB components in `0.0..=1.0`.
    pub overlay_color: [f32; 3],
}

impl Default for RepairOptions {
    fn default() -> Self {
        RepairOptions {
            overlay_font_path: PathBuf::from("NotoSansKR-Regular.ttf"),
            mapping_path: None,
            visible_overlay: false,
            overlay_color: [0.0, 0.0, 1.0],
        }
    }
}

/// Aggregate counters over every page of a repaired document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairSummary {
    pub pages: usize,
    /// Glyphs of the original layer which were converted into filled outlines.
    pub painted_glyphs: usize,
    /// Visible glyphs removed because their font carried no embeddable outline.
    pub dropped_glyphs: usize,
    /// Glyphs which were already invisible and were removed without replacement.
    pub invisible_glyphs: usize,
    /// Spans which received an overlay run.
    pub overlaid_spans: usize,
    /// Spans skipped because they held no decodable text or no overlay glyphs.
    pub skipped_spans: usize,
}

/// Repair a single PDF file: strip the text layer of every page into vector
/// paths, overlay the remapped Unicode text, and save the document to
/// `output_path`.
pub fn repair_file(
    input_path: &Path,
    output_path: &Path,
    options: &RepairOptions,
) -> Result<RepairSummary, ContextError> {
    let mut table = PuaTable::default();
    if let Some(mapping_path) = &options.mapping_path {
        table.merge(PuaTable::from_json_file(mapping_path)?);
    }
    log::info!("Loaded a mapping table with {} entries", table.len());

    let overlay_font = OverlayFont::from_file(&options.overlay_font_path)?;
    let style = OverlayStyle {
        visible: options.visible_overlay,
        color: options.overlay_color,
    };

    let mut document = lopdf::Document::load(input_path).map_err(|error| {
        ContextError::with_error(
            format!("Unable to load the PDF document {:?}", input_path),
            &error,
        )
    })?;

    // The overlay font is shared by every page, so it goes into the document once
    // and every page's resources point at the same object.
    let overlay_font_dictionary = overlay_font.insert_into_document(&mut document);
    let overlay_font_id = document.add_object(Object::Dictionary(overlay_font_dictionary));

    let mut summary = RepairSummary::default();
    let pages = document.get_pages();
    for (page_number, page_id) in pages {
        let page_summary = repair_page(
            &mut document,
            page_id,
            &table,
            &overlay_font,
            &style,
            overlay_font_id,
        )
        .map_err(|error| {
            ContextError::with_message(
                format!("Unable to repair the page {}", page_number),
                error.to_string(),
            )
        })?;

        log::info!(
            "Page {}: painted {} glyphs as paths, removed {} invisible, dropped {}; overlaid {} spans, skipped {}",
            page_number,
            page_summary.painted_glyphs,
            page_summary.invisible_glyphs,
            page_summary.dropped_glyphs,
            page_summary.overlaid_spans,
            page_summary.skipped_spans,
        );

        summary.pages += 1;
        summary.painted_glyphs += page_summary.painted_glyphs;
        summary.dropped_glyphs += page_summary.dropped_glyphs;
        summary.invisible_glyphs += page_summary.invisible_glyphs;
        summary.overlaid_spans += page_summary.overlaid_spans;
        summary.skipped_spans += page_summary.skipped_spans;
    }

    update_document_information(&mut document);

    document.prune_objects();
    document.delete_zero_length_streams();
    document.renumber_objects();
    document.compress();

    document.save(output_path).map_err(|error| {
        ContextError::with_error(
            format!("Unable to save the PDF document {:?}", output_path),
            &error,
        )
    })?;

    Ok(summary)
}

/// Strip and overlay one page. The original content is wrapped in `q`/`Q` so the
/// overlay operations start from the default graphics state whatever the page
/// left behind.
fn repair_page(
    document: &mut lopdf::Document,
    page_id: lopdf::ObjectId,
    table: &PuaTable,
    overlay_font: &OverlayFont,
    style: &OverlayStyle,
    overlay_font_id: lopdf::ObjectId,
) -> Result<RepairSummary, ContextError> {
    let content_bytes = document.get_page_content(page_id).map_err(|error| {
        ContextError::with_error("Unable to read the content stream of the page", &error)
    })?;
    let content = Content::decode(&content_bytes).map_err(|error| {
        ContextError::with_error("Unable to decode the content stream of the page", &error)
    })?;
    let fonts = collect_page_fonts(document, page_id);
    warn_about_form_xobjects(document, page_id);

    let spans = collect_spans(&content, &fonts);
    let stripped = strip_page_text(&content, &fonts);

    let mut operations = Vec::with_capacity(stripped.operations.len() + 2);
    operations.push(Operation::new("q", vec![]));
    operations.extend(stripped.operations);
    operations.push(Operation::new("Q", vec![]));

    let mut overlaid_spans = 0;
    let mut skipped_spans = 0;
    for span in &spans {
        match layout_span(span, table, overlay_font) {
            Some(layout) => {
                operations.extend(overlay_font.layout_operations(&layout, style));
                overlaid_spans += 1;
            }
            None => {
                log::debug!(
                    "Skipping a span at {:?} with no overlayable text",
                    span.origin
                );
                skipped_spans += 1;
            }
        }
    }

    let encoded = Content { operations }.encode().map_err(|error| {
        ContextError::with_error("Unable to encode the rewritten content stream", &error)
    })?;
    document
        .change_page_content(page_id, encoded)
        .map_err(|error| {
            ContextError::with_error("Unable to replace the content stream of the page", &error)
        })?;

    replace_page_fonts(document, page_id, overlay_font_id)?;

    Ok(RepairSummary {
        pages: 1,
        painted_glyphs: stripped.painted_glyphs,
        dropped_glyphs: stripped.dropped_glyphs,
        invisible_glyphs: stripped.invisible_glyphs,
        overlaid_spans,
        skipped_spans,
    })
}

/// Point the page's `Font` resources at the overlay font alone. The original
/// fonts are no longer referenced by the rewritten content, so pruning drops
/// them from the saved file.
fn replace_page_fonts(
    document: &mut lopdf::Document,
    page_id: lopdf::ObjectId,
    overlay_font_id: lopdf::ObjectId,
) -> Result<(), ContextError> {
    let font_dictionary = lopdf::Dictionary::from_iter(vec![(
        OVERLAY_FONT_RESOURCE,
        Object::Reference(overlay_font_id),
    )]);

    // Resources may sit inline in the page dictionary or behind a reference
    // (possibly inherited and shared, in which case the page gets its own copy).
    let page_dictionary = document
        .get_object(page_id)
        .and_then(Object::as_dict)
        .map_err(|error| {
            ContextError::with_error("Unable to read the dictionary of the page", &error)
        })?;

    let mut resources = match page_dictionary.get(b"Resources") {
        Ok(object) => match resolve(document, object) {
            Object::Dictionary(dictionary) => dictionary.clone(),
            _ => lopdf::Dictionary::new(),
        },
        Err(_) => lopdf::Dictionary::new(),
    };
    resources.set("Font", Object::Dictionary(font_dictionary));

    let page_dictionary = document
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|error| {
            ContextError::with_error("Unable to access the dictionary of the page", &error)
        })?;
    page_dictionary.set("Resources", Object::Dictionary(resources));

    Ok(())
}

/// Content inside form XObjects is not rewritten; if a page references any, its
/// text (if it has some) stays selectable.
fn warn_about_form_xobjects(document: &lopdf::Document, page_id: lopdf::ObjectId) {
    let (resources, _) = document.get_page_resources(page_id);
    if let Some(resources) = resources {
        if resources.get(b"XObject").is_ok() {
            log::warn!(
                "The page {:?} references XObjects, any text inside them is left untouched",
                page_id
            );
        }
    }
}

/// Stamp the document information dictionary with the modification date. The
/// dictionary may sit behind a reference or directly in the trailer; either way
/// its other entries are kept. When the document carries no information
/// dictionary, a fresh one is created.
fn update_document_information(document: &mut lopdf::Document) {
    let timestamp = Object::String(
        to_pdf_timestamp_format(&OffsetDateTime::now_utc()).into_bytes(),
        lopdf::StringFormat::Literal,
    );

    let is_direct_dictionary = matches!(
        document.trailer.get(b"Info"),
        Ok(Object::Dictionary(_))
    );
    if is_direct_dictionary {
        if let Ok(Object::Dictionary(information)) = document.trailer.get_mut(b"Info") {
            information.set("ModDate", timestamp);
        }
        return;
    }

    let existing = document
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|object| match object {
            Object::Reference(id) => Some(*id),
            _ => None,
        });

    match existing {
        Some(info_id) => {
            if let Ok(Object::Dictionary(information)) = document.get_object_mut(info_id) {
                information.set("ModDate", timestamp);
            }
        }
        None => {
            let information = lopdf::Dictionary::from_iter(vec![("ModDate", timestamp)]);
            let info_id = document.add_object(Object::Dictionary(information));
            document.trailer.set("Info", Object::Reference(info_id));
        }
    }
}

/// Formats the given time so that it matches what the PDF specification expects.
/// An example of it is the following: D:20170505150224+02'00'.
fn to_pdf_timestamp_format(date: &OffsetDateTime) -> String {
    let offset = date.offset();
    let offset_sign = if offset.is_negative() { '-' } else { '+' };
    format!(
        "D:{:04}{:02}{:02}{:02}{:02}{:02}{offset_sign}{:02}'{:02}'",
        date.year(),
        u8::from(date.month()),
        date.day(),
        date.hour(),
        date.minute(),
        date.second(),
        offset.whole_hours().abs(),
        offset.minutes_past_hour().abs(),
    )
}

/// Print the text layer of a PDF, page by page, to standard output. Spans are
/// printed in content-stream order, one per line.
pub fn dump_text(path: &Path) -> Result<(), ContextError> {
    let document = lopdf::Document::load(path).map_err(|error| {
        ContextError::with_error(format!("Unable to load the PDF document {:?}", path), &error)
    })?;

    let pages: BTreeMap<u32, lopdf::ObjectId> = document.get_pages();
    for (page_number, page_id) in pages {
        println!("--- Page {} ---", page_number);
        let spans = extract_page_spans(&document, page_id).map_err(|error| {
            ContextError::with_message(
                format!("Unable to extract the text of the page {}", page_number),
                error.to_string(),
            )
        })?;
        for span in spans {
            if !span.text.is_empty() {
                println!("{}", span.text);
            }
        }
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_timestamps_follow_the_specification_format() {
        let timestamp = to_pdf_timestamp_format(&OffsetDateTime::UNIX_EPOCH);
        assert_eq!(timestamp, "D:19700101000000+00'00'");
    }

    #[test]
    fn stamping_a_direct_information_dictionary_keeps_its_other_entries() {
        let mut document = lopdf::Document::with_version("1.5");
        let information = lopdf::Dictionary::from_iter(vec![(
            "Title",
            Object::String(b"A scanned booklet".to_vec(), lopdf::StringFormat::Literal),
        )]);
        document.trailer.set("Info", Object::Dictionary(information));

        update_document_information(&mut document);

        let Ok(Object::Dictionary(information)) = document.trailer.get(b"Info") else {
            panic!("the information dictionary must stay directly in the trailer");
        };
        assert_eq!(
            information.get(b"Title").ok(),
            Some(&Object::String(
                b"A scanned booklet".to_vec(),
                lopdf::StringFormat::Literal
            ))
        );
        assert!(information.get(b"ModDate").is_ok());
    }

    #[test]
    fn default_options_produce_an_invisible_blue_overlay() {
        let options = RepairOptions::default();
        assert!(!options.visible_overlay);
        assert_eq!(options.overlay_color, [0.0, 0.0, 1.0]);
    }
}
