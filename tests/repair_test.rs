use lopdf::{
    content::{Content, Operation},
    dictionary, Object, Stream,
};
use rand::Rng as _;
use similar_asserts::assert_eq;

use depua::{
    document::{repair_file, RepairOptions},
    extraction::extract_page_spans,
    fonts::collect_page_fonts,
    mapping::{contains_private_use, PuaTable},
    stripping::strip_page_text,
};

/// A ToUnicode CMap mapping the codes 1, 2 and 3 to U+F721, U+F730 and a space.
const TO_UNICODE_CMAP: &str = r"/CIDInit /ProcSet findresource begin
12 dict begin
begincmap
/CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def
/CMapName /Adobe-Identity-UCS def
/CMapType 2 def
1 begincodespacerange
<0000> <ffff>
endcodespacerange
3 beginbfchar
<0001> <f721>
<0002> <f730>
<0003> <0020>
endbfchar
endcmap
CMapName currentdict /CMap defineresource pop
end
end";

/// Builds the smallest document this tool is meant for: one page whose text is
/// shown in rendering mode 3 through a Type0 font with PUA code points in its
/// ToUnicode CMap, over a filled rectangle. The font embeds no font program,
/// exactly like the output of OCR generators that rely on a viewer-side font.
fn synthetic_ocr_document() -> (lopdf::Document, lopdf::ObjectId) {
    let mut document = lopdf::Document::with_version("1.5");
    let pages_id = document.new_object_id();

    let to_unicode_id = document.add_object(Stream::new(
        dictionary! {},
        TO_UNICODE_CMAP.as_bytes().to_vec(),
    ));
    let descendant_font = dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => "SyntheticOCR",
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Identity"),
            "Supplement" => 0,
        },
        "DW" => 1000,
        "W" => vec![
            1.into(),
            vec![600.into(), 600.into(), 600.into()].into(),
        ],
        "CIDToGIDMap" => "Identity",
    };
    let font_id = document.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => "SyntheticOCR",
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![Object::Dictionary(descendant_font)],
        "ToUnicode" => Object::Reference(to_unicode_id),
    });

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new("re", vec![10.into(), 10.into(), 100.into(), 50.into()]),
            Operation::new("f", vec![]),
            Operation::new("Q", vec![]),
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Tr", vec![3.into()]),
            Operation::new(
                "Tm",
                vec![
                    1.into(),
                    0.into(),
                    0.into(),
                    1.into(),
                    72.into(),
                    700.into(),
                ],
            ),
            Operation::new(
                "Tj",
                vec![Object::String(
                    vec![0x00, 0x01, 0x00, 0x02, 0x00, 0x03],
                    lopdf::StringFormat::Hexadecimal,
                )],
            ),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = document.add_object(Stream::new(
        dictionary! {},
        content.encode().expect("Unable to encode the content"),
    ));

    let page_id = document.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => Object::Reference(pages_id),
        "Contents" => Object::Reference(content_id),
        "Resources" => dictionary! {
            "Font" => dictionary! { "F1" => Object::Reference(font_id) },
        },
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    });

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => vec![Object::Reference(page_id)],
        "Count" => 1,
    };
    document
        .objects
        .insert(pages_id, Object::Dictionary(pages));
    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    document.trailer.set("Root", Object::Reference(catalog_id));

    (document, page_id)
}

#[test]
fn spans_extracted_from_a_type0_document_carry_the_pua_text_and_geometry() {
    let (document, page_id) = synthetic_ocr_document();

    let spans = extract_page_spans(&document, page_id).expect("Unable to extract the spans");
    assert_eq!(spans.len(), 1);

    let span = &spans[0];
    assert_eq!(span.text, "\u{F721}\u{F730} ");
    assert!(contains_private_use(&span.text));
    assert_eq!(span.origin, [72.0, 700.0]);
    assert_eq!(span.font_size, 12.0);
    assert_eq!(span.rendering_mode, 3);
    // Three codes of width 600, at size 12: 3 * 600 / 1000 * 12.
    assert!((span.advance_width - 21.6).abs() < 1e-3);
}

#[test]
fn stripping_removes_the_text_layer_and_keeps_the_graphics() {
    let (document, page_id) = synthetic_ocr_document();

    let content_bytes = document
        .get_page_content(page_id)
        .expect("Unable to read the page content");
    let content = Content::decode(&content_bytes).expect("Unable to decode the page content");
    let fonts = collect_page_fonts(&document, page_id);

    let outcome = strip_page_text(&content, &fonts);

    // The glyphs were shown in rendering mode 3 and leave nothing behind.
    assert_eq!(outcome.invisible_glyphs, 3);
    assert_eq!(outcome.dropped_glyphs, 0);
    assert_eq!(outcome.painted_glyphs, 0);

    let operators: Vec<&str> = outcome
        .operations
        .iter()
        .map(|operation| operation.operator.as_str())
        .collect();
    assert_eq!(operators, vec!["q", "re", "f", "Q"]);
}

#[test]
fn remapping_the_extracted_text_yields_correct_unicode() {
    let (document, page_id) = synthetic_ocr_document();
    let spans = extract_page_spans(&document, page_id).expect("Unable to extract the spans");

    let table = PuaTable::default();
    let remapped = table.remap(&spans[0].text);

    assert_eq!(remapped, "!0 ");
    assert!(!contains_private_use(&remapped));
}

#[test]
fn random_text_without_private_use_characters_survives_remapping() {
    let table = PuaTable::default();
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        let length = rng.gen_range(1..=120);
        let text: String = rand_utf8::rand_utf8(&mut rng, length)
            .chars()
            .filter(|&character| !depua::mapping::is_private_use(character))
            .collect();

        let remapped = table.remap(&text);
        let normalized: String =
            unicode_normalization::UnicodeNormalization::nfc(text.chars()).collect();
        assert_eq!(remapped, normalized);
    }
}

#[test]
fn random_sequences_of_mapped_codes_remap_to_their_replacements() {
    let table = PuaTable::default();
    // The oldstyle figures of the built-in table: U+F730 stands for 0 and so on.
    let mut rng = rand::thread_rng();

    for _ in 0..50 {
        let digits: Vec<u32> = (0..rng.gen_range(1..=30))
            .map(|_| rng.gen_range(0..=9))
            .collect();
        let text: String = digits
            .iter()
            .filter_map(|digit| char::from_u32(0xF730 + digit))
            .collect();
        let expected: String = digits
            .iter()
            .filter_map(|digit| char::from_digit(*digit, 10))
            .collect();

        assert_eq!(table.remap(&text), expected);
    }
}

/// The end-to-end test needs a real TrueType font for the overlay; point the
/// `DEPUA_TEST_FONT` environment variable at one (any Latin font works) to run it.
#[test]
fn repairing_a_document_end_to_end_with_a_real_overlay_font() {
    let Ok(font_path) = std::env::var("DEPUA_TEST_FONT") else {
        eprintln!("DEPUA_TEST_FONT is not set, skipping the end-to-end repair test");
        return;
    };

    let (mut document, _) = synthetic_ocr_document();
    let input_path = std::env::temp_dir().join("depua_end_to_end_input.pdf");
    let output_path = std::env::temp_dir().join("depua_end_to_end_output.pdf");
    document
        .save(&input_path)
        .expect("Unable to save the input document");

    let options = RepairOptions {
        overlay_font_path: font_path.into(),
        ..RepairOptions::default()
    };
    let summary =
        repair_file(&input_path, &output_path, &options).expect("Unable to repair the document");

    assert_eq!(summary.pages, 1);
    assert_eq!(summary.invisible_glyphs, 3);
    assert_eq!(summary.overlaid_spans, 1);

    // The rebuilt text layer must round-trip to the corrected Unicode.
    let repaired = lopdf::Document::load(&output_path).expect("Unable to load the repaired document");
    let pages = repaired.get_pages();
    let page_id = pages[&1];
    let spans = extract_page_spans(&repaired, page_id).expect("Unable to extract the spans");

    let text: String = spans.iter().map(|span| span.text.as_str()).collect();
    assert!(
        text.contains("!0"),
        "the repaired text layer reads {:?}",
        text
    );
    assert!(!contains_private_use(&text));
}
